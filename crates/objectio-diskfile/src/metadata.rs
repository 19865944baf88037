//! Object metadata persistence
//!
//! Metadata is a string map serialized as JSON and stored in extended
//! attributes of the `.data`/`.meta`/`.ts` file itself, split across
//! `user.objectio.metadata`, `user.objectio.metadata1`, ... so each value
//! fits the attribute size limits of older filesystems.

use crate::raw_io;
use objectio_common::{Error, Metadata, Result};
use std::fs::File;
use std::path::Path;

pub const NAME: &str = "name";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const ETAG: &str = "ETag";
pub const X_TIMESTAMP: &str = "X-Timestamp";
pub const X_DELETE_AT: &str = "X-Delete-At";
pub const DELETED: &str = "deleted";
/// Fragment index of an erasure-coded data file
pub const EC_FRAG_INDEX: &str = "X-Object-Sysmeta-Ec-Frag-Index";

const METADATA_KEY: &str = "user.objectio.metadata";
const CHUNK_SIZE: usize = 254;

/// Keys of the data file that a `.meta` overlay can never replace
const DATAFILE_SYSTEM_META: [&str; 4] = ["content-length", "content-type", "deleted", "etag"];
const SYSMETA_PREFIX: &str = "x-object-sysmeta-";

fn chunk_key(index: usize) -> String {
    if index == 0 {
        METADATA_KEY.to_string()
    } else {
        format!("{METADATA_KEY}{index}")
    }
}

fn xattr_error(err: std::io::Error, path: &Path) -> Error {
    if raw_io::is_xattr_unsupported(&err) {
        Error::XattrNotSupported(path.to_path_buf())
    } else {
        Error::DiskIo(err)
    }
}

/// Store `metadata` on an open file
pub fn write_metadata(file: &File, path: &Path, metadata: &Metadata) -> Result<()> {
    let encoded =
        serde_json::to_vec(metadata).map_err(|e| Error::Metadata(format!("encode failed: {e}")))?;
    for (index, chunk) in encoded.chunks(CHUNK_SIZE).enumerate() {
        raw_io::set_xattr(file, &chunk_key(index), chunk).map_err(|e| xattr_error(e, path))?;
    }
    Ok(())
}

/// Load metadata from an open file.
///
/// Missing or undecodable metadata is reported as [`Error::Metadata`];
/// callers treat that as corruption.
pub fn read_metadata(file: &File, path: &Path) -> Result<Metadata> {
    let mut encoded = Vec::new();
    for index in 0.. {
        match raw_io::get_xattr(file, &chunk_key(index)).map_err(|e| xattr_error(e, path))? {
            Some(chunk) => encoded.extend_from_slice(&chunk),
            None => break,
        }
    }
    if encoded.is_empty() {
        return Err(Error::Metadata(format!(
            "no metadata found on {}",
            path.display()
        )));
    }
    serde_json::from_slice(&encoded).map_err(|e| {
        Error::Metadata(format!("unreadable metadata on {}: {e}", path.display()))
    })
}

/// Whether a key belongs to the data file and survives a `.meta` overlay
#[must_use]
pub fn is_datafile_system_meta(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    DATAFILE_SYSTEM_META.contains(&lower.as_str()) || lower.starts_with(SYSMETA_PREFIX)
}

/// Overlay `.meta` metadata on data file metadata.
///
/// The overlay wins for every key except the data file's system metadata
/// and its stored name. Keys are compared case-insensitively.
#[must_use]
pub fn merge(data: Metadata, overlay: Metadata) -> Metadata {
    let mut merged = data;
    for (key, value) in overlay {
        if key == NAME || is_datafile_system_meta(&key) {
            continue;
        }
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(&key));
        merged.insert(key, value);
    }
    merged
}

/// Case-insensitive lookup
#[must_use]
pub fn get<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .or_else(|| {
            metadata
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn md(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_metadata_spans_several_attributes() {
        let temp = NamedTempFile::new().unwrap();
        let mut metadata = md(&[(NAME, "/a/c/o"), (CONTENT_LENGTH, "3")]);
        metadata.insert("X-Object-Meta-Long".into(), "x".repeat(1000));

        match write_metadata(temp.as_file(), temp.path(), &metadata) {
            Ok(()) => {}
            Err(Error::XattrNotSupported(_)) => return,
            Err(e) => panic!("write_metadata failed: {e}"),
        }
        assert!(raw_io::get_xattr(temp.as_file(), &chunk_key(4)).unwrap().is_some());
        assert_eq!(read_metadata(temp.as_file(), temp.path()).unwrap(), metadata);
    }

    #[test]
    fn test_missing_metadata() {
        let temp = NamedTempFile::new().unwrap();
        let err = read_metadata(temp.as_file(), temp.path()).unwrap_err();
        assert!(matches!(err, Error::Metadata(_) | Error::XattrNotSupported(_)));
    }

    #[test]
    fn test_garbled_metadata() {
        let temp = NamedTempFile::new().unwrap();
        if raw_io::set_xattr(temp.as_file(), METADATA_KEY, b"{not json").is_err() {
            return;
        }
        assert!(matches!(
            read_metadata(temp.as_file(), temp.path()),
            Err(Error::Metadata(_))
        ));
    }

    #[test]
    fn test_merge_protects_system_metadata() {
        let data = md(&[
            (NAME, "/a/c/o"),
            (CONTENT_LENGTH, "10"),
            (CONTENT_TYPE, "text/plain"),
            (ETAG, "abc"),
            (X_TIMESTAMP, "0000001000.00000"),
            ("X-Object-Sysmeta-Foo", "data"),
            ("X-Object-Meta-Color", "red"),
        ]);
        let overlay = md(&[
            (NAME, "/x/y/z"),
            ("content-length", "99"),
            ("Content-Type", "image/png"),
            ("x-object-sysmeta-foo", "meta"),
            (X_TIMESTAMP, "0000001001.00000"),
            ("x-object-meta-color", "blue"),
            ("X-Object-Meta-Shape", "round"),
        ]);
        let merged = merge(data, overlay);

        assert_eq!(get(&merged, NAME), Some("/a/c/o"));
        assert_eq!(get(&merged, CONTENT_LENGTH), Some("10"));
        assert_eq!(get(&merged, CONTENT_TYPE), Some("text/plain"));
        assert_eq!(get(&merged, ETAG), Some("abc"));
        assert_eq!(get(&merged, "X-Object-Sysmeta-Foo"), Some("data"));
        assert_eq!(get(&merged, X_TIMESTAMP), Some("0000001001.00000"));
        assert_eq!(get(&merged, "X-Object-Meta-Color"), Some("blue"));
        assert_eq!(get(&merged, "X-Object-Meta-Shape"), Some("round"));
        // Overlaid key replaced the differently-cased original
        assert!(!merged.contains_key("X-Object-Meta-Color"));
    }
}

//! Atomic object writes
//!
//! Bytes go to an anonymous file in the device's `tmp` area. `put` stamps
//! the metadata on it, syncs it and renames it into the hash directory, so
//! readers see either the previous version or the complete new one.

use crate::diskfile::DiskFile;
use crate::fileset::{DURABLE_EXT, FileKind};
use crate::metadata::{self, CONTENT_LENGTH, EC_FRAG_INDEX, ETAG, NAME, X_TIMESTAMP};
use crate::raw_io;
use objectio_common::{Error, Metadata, Result, Timestamp};
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Disk-full errors become [`Error::NoSpace`]
fn classify(err: Error, required: u64) -> Error {
    match err {
        Error::DiskIo(e) => Error::from_alloc(e, required),
        other => other,
    }
}

/// Writer for one new version of an object
pub struct DiskFileWriter {
    diskfile: DiskFile,
    temp: Option<NamedTempFile>,
    fd: Arc<File>,
    upload_size: u64,
    last_sync: u64,
    bytes_per_sync: u64,
    md5: md5::Context,
}

impl DiskFileWriter {
    pub(crate) fn new(diskfile: DiskFile, temp: NamedTempFile) -> Result<Self> {
        let fd = Arc::new(temp.as_file().try_clone()?);
        let bytes_per_sync = diskfile.manager.config().bytes_per_sync();
        Ok(Self {
            diskfile,
            temp: Some(temp),
            fd,
            upload_size: 0,
            last_sync: 0,
            bytes_per_sync,
            md5: md5::Context::new(),
        })
    }

    /// Bytes written so far
    #[must_use]
    pub const fn upload_size(&self) -> u64 {
        self.upload_size
    }

    /// Append a chunk, periodically flushing written data to disk
    pub fn write(&mut self, chunk: &[u8]) -> Result<usize> {
        let fd = Arc::clone(&self.fd);
        let data = chunk.to_vec();
        let offset = self.upload_size;
        let len = chunk.len() as u64;
        self.diskfile.pool.run(move || {
            fd.write_all_at(&data, offset)
                .map_err(|e| Error::from_alloc(e, len))
        })?;

        self.md5.consume(chunk);
        self.upload_size += len;

        if self.bytes_per_sync > 0 && self.upload_size - self.last_sync >= self.bytes_per_sync {
            let fd = Arc::clone(&self.fd);
            let (start, end) = (self.last_sync, self.upload_size);
            self.diskfile.pool.run(move || {
                fd.sync_data()?;
                raw_io::drop_buffer_cache(&fd, start, end - start);
                Ok(())
            })?;
            self.last_sync = end;
        }
        Ok(chunk.len())
    }

    /// Commit the written bytes as the object's new `.data` file.
    ///
    /// `metadata` must carry `X-Timestamp`. `Content-Length` and `ETag`
    /// default to the size and MD5 of what was written.
    pub fn put(self, metadata: Metadata) -> Result<PathBuf> {
        self.put_as(metadata, FileKind::Data)
    }

    pub(crate) fn put_as(mut self, mut metadata: Metadata, kind: FileKind) -> Result<PathBuf> {
        let timestamp: Timestamp = metadata::get(&metadata, X_TIMESTAMP)
            .ok_or_else(|| Error::invalid_argument("X-Timestamp is required"))?
            .parse()?;
        if let Some(name) = self.diskfile.name() {
            metadata.insert(NAME.to_string(), name.path());
        }

        let layout = self.diskfile.policy().layout();
        let filename = match kind {
            FileKind::Data => {
                if metadata::get(&metadata, CONTENT_LENGTH).is_none() {
                    metadata.insert(CONTENT_LENGTH.to_string(), self.upload_size.to_string());
                }
                if metadata::get(&metadata, ETAG).is_none() {
                    let digest = std::mem::replace(&mut self.md5, md5::Context::new()).compute();
                    metadata.insert(ETAG.to_string(), format!("{digest:x}"));
                }
                layout.data_filename(&timestamp, self.frag_index(&metadata)?)?
            }
            FileKind::Meta | FileKind::Tombstone => {
                format!("{}{}", timestamp.internal(), kind.ext())
            }
            FileKind::Durable => {
                return Err(Error::internal("durable markers are written by put"));
            }
        };

        let datadir = self.diskfile.datadir().to_path_buf();
        let target = datadir.join(&filename);
        let durable = (kind == FileKind::Data && layout.writes_durable())
            .then(|| datadir.join(format!("{}{DURABLE_EXT}", timestamp.internal())));
        let temp = self
            .temp
            .take()
            .ok_or_else(|| Error::internal("writer already committed"))?;
        let size = self.upload_size;

        let committed = target.clone();
        self.diskfile
            .pool
            .run(move || {
                metadata::write_metadata(temp.as_file(), temp.path(), &metadata)?;
                temp.as_file().sync_all()?;
                raw_io::drop_buffer_cache(temp.as_file(), 0, size);
                fs::create_dir_all(&datadir)?;
                temp.persist(&committed).map_err(|e| Error::DiskIo(e.error))?;
                if let Some(durable) = durable {
                    File::create(&durable)?.sync_all()?;
                }
                raw_io::fsync_dir(&datadir)?;
                Ok(())
            })
            .map_err(|e| classify(e, size))?;
        debug!("Committed {}", target.display());

        self.finalize();
        Ok(target)
    }

    fn frag_index(&self, metadata: &Metadata) -> Result<Option<u32>> {
        if let Some(index) = self.diskfile.frag_index() {
            return Ok(Some(index));
        }
        metadata::get(metadata, EC_FRAG_INDEX)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("bad {EC_FRAG_INDEX} {v}")))
            })
            .transpose()
    }

    /// Post-commit housekeeping; the write already succeeded
    fn finalize(&self) {
        let manager = &self.diskfile.manager;
        let datadir = self.diskfile.datadir();
        let policy = self.diskfile.policy();
        if let Err(e) = manager.cleanup(datadir, policy, manager.config().reclaim_age()) {
            warn!("Cleanup after commit failed for {}: {}", datadir.display(), e);
        }
        if let Some(suffix_dir) = datadir.parent() {
            if let Err(e) = manager.invalidate_hash(suffix_dir) {
                warn!("Failed to invalidate {}: {}", suffix_dir.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for DiskFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFileWriter")
            .field("datadir", &self.diskfile.datadir())
            .field("upload_size", &self.upload_size)
            .finish_non_exhaustive()
    }
}

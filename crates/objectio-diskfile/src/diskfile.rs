//! Diskfile: one object in one hash directory
//!
//! ```text
//! DiskFile ──open()──▶ OpenDiskFile ──reader()──▶ DiskFileReader
//!    │
//!    └──create()──▶ DiskFileWriter ──put()──▶ committed .data
//! ```
//!
//! Every transition consumes the previous handle, so a reader can only be
//! built from a successfully opened and verified file.

use crate::fileset::{self, FileKind};
use crate::manager::{DiskFileManager, is_not_dir, listdir};
use crate::metadata::{self, CONTENT_LENGTH, NAME, X_DELETE_AT, X_TIMESTAMP};
use crate::policy::StoragePolicy;
use crate::raw_io;
use crate::reader::DiskFileReader;
use crate::threadpool::ThreadPool;
use crate::writer::DiskFileWriter;
use objectio_common::{Error, Metadata, ObjectName, Result, Timestamp, storage_directory};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Handle on one object's hash directory, not yet opened
#[derive(Debug)]
pub struct DiskFile {
    pub(crate) manager: DiskFileManager,
    device: String,
    device_path: PathBuf,
    partition: String,
    policy: Arc<StoragePolicy>,
    name: Option<ObjectName>,
    hash: String,
    datadir: PathBuf,
    frag_index: Option<u32>,
    pub(crate) pool: Arc<ThreadPool>,
}

/// Outcome of [`DiskFile::lookup`]
#[derive(Debug)]
pub enum Lookup {
    Found(OpenDiskFile),
    Absent,
    Deleted(Timestamp),
    Expired(Timestamp),
    /// Quarantined during open
    Corrupt(String),
}

impl DiskFile {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        manager: DiskFileManager,
        device: &str,
        device_path: PathBuf,
        partition: &str,
        hash: String,
        name: Option<ObjectName>,
        policy: Arc<StoragePolicy>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        let datadir = storage_directory(&device_path.join(policy.data_dir()), partition, &hash);
        Self {
            manager,
            device: device.to_string(),
            device_path,
            partition: partition.to_string(),
            policy,
            name,
            hash,
            datadir,
            frag_index: None,
            pool,
        }
    }

    /// Select one fragment of an erasure-coded object
    #[must_use]
    pub fn with_frag_index(mut self, frag_index: u32) -> Self {
        self.frag_index = Some(frag_index);
        self
    }

    /// Use a hash directory found on disk instead of the computed one
    pub(crate) fn with_datadir(mut self, datadir: PathBuf) -> Self {
        self.datadir = datadir;
        self
    }

    /// Object identity, if known or recovered
    #[must_use]
    pub fn name(&self) -> Option<&ObjectName> {
        self.name.as_ref()
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    #[must_use]
    pub fn partition(&self) -> &str {
        &self.partition
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<StoragePolicy> {
        &self.policy
    }

    /// The hash directory
    #[must_use]
    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    #[must_use]
    pub const fn frag_index(&self) -> Option<u32> {
        self.frag_index
    }

    /// Quarantine this object's hash directory
    pub(crate) fn quarantine(&self, reason: &str) -> Error {
        self.quarantine_unit(&self.datadir, reason)
    }

    fn quarantine_unit(&self, unit: &Path, reason: &str) -> Error {
        self.manager
            .quarantine(&self.device_path, unit, &self.policy, reason)
    }

    /// Open and verify the current version of the object.
    ///
    /// Absence comes back as [`Error::NotExist`], [`Error::Deleted`] or
    /// [`Error::Expired`]. Failed verification quarantines the hash
    /// directory and returns [`Error::Quarantined`]. A stored name that
    /// differs from the requested one is an [`Error::Collision`].
    pub fn open(self) -> Result<OpenDiskFile> {
        let pool = Arc::clone(&self.pool);
        pool.run(move || self.open_blocking())
    }

    /// Like [`Self::open`], with expected absence and corruption folded
    /// into [`Lookup`]
    pub fn lookup(self) -> Result<Lookup> {
        match self.open() {
            Ok(open) => Ok(Lookup::Found(open)),
            Err(Error::NotExist) => Ok(Lookup::Absent),
            Err(Error::Deleted { timestamp }) => Ok(Lookup::Deleted(timestamp)),
            Err(Error::Expired { delete_at }) => Ok(Lookup::Expired(delete_at)),
            Err(Error::Quarantined { reason }) => Ok(Lookup::Corrupt(reason)),
            Err(e) => Err(e),
        }
    }

    fn open_blocking(mut self) -> Result<OpenDiskFile> {
        let files = match listdir(&self.datadir) {
            Ok(files) => files,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) if is_not_dir(&e) => {
                let reason = format!("Expected directory, found file at {}", self.datadir.display());
                return Err(self.quarantine(&reason));
            }
            Err(e) => return Err(e.into()),
        };

        let fileset = fileset::resolve(self.policy.layout(), &files, self.frag_index)?;
        let Some(data) = fileset.data_file else {
            return Err(match fileset.ts_file {
                Some(ts) => Error::Deleted {
                    timestamp: ts.timestamp,
                },
                None => Error::NotExist,
            });
        };

        let data_file = self.datadir.join(&data.filename);
        let file = match File::open(&data_file) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::NotExist),
            Err(e) => return Err(e.into()),
        };
        let mut metadata = self.read_verified_metadata(&file, &data_file)?;

        let meta_file = fileset.meta_file.map(|m| self.datadir.join(m.filename));
        if let Some(path) = &meta_file {
            match File::open(path) {
                Ok(overlay_file) => {
                    let overlay = self.read_verified_metadata(&overlay_file, path)?;
                    metadata = metadata::merge(metadata, overlay);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.verify_name(&metadata)?;
        self.verify_not_expired(&metadata)?;
        let size = self.verify_size(&file, &metadata)?;

        Ok(OpenDiskFile {
            diskfile: self,
            file,
            data_file,
            meta_file,
            metadata,
            timestamp: data.timestamp,
            size,
        })
    }

    fn read_verified_metadata(&self, file: &File, path: &Path) -> Result<Metadata> {
        match metadata::read_metadata(file, path) {
            Err(Error::Metadata(msg)) => {
                Err(self.quarantine(&format!("Exception reading metadata: {msg}")))
            }
            other => other,
        }
    }

    fn verify_name(&mut self, metadata: &Metadata) -> Result<()> {
        let Some(stored) = metadata::get(metadata, NAME) else {
            return Err(self.quarantine("missing name metadata"));
        };
        match &self.name {
            Some(name) => {
                let requested = name.path();
                if stored != requested {
                    return Err(Error::Collision {
                        requested,
                        stored: stored.to_string(),
                    });
                }
            }
            None => {
                let Ok(name) = ObjectName::parse(stored) else {
                    return Err(self.quarantine(&format!("invalid name metadata {stored}")));
                };
                if self.manager.hash_path(&name) != self.hash {
                    return Err(self.quarantine(&format!(
                        "name metadata {stored} does not hash to {}",
                        self.hash
                    )));
                }
                self.name = Some(name);
            }
        }
        Ok(())
    }

    fn verify_not_expired(&self, metadata: &Metadata) -> Result<()> {
        let Some(value) = metadata::get(metadata, X_DELETE_AT) else {
            return Ok(());
        };
        let Ok(secs) = value.trim().parse::<u64>() else {
            return Err(self.quarantine(&format!("bad metadata x-delete-at value {value}")));
        };
        #[allow(clippy::cast_precision_loss)]
        let delete_at = Timestamp::from_secs(secs as f64);
        if delete_at <= Timestamp::now() {
            return Err(Error::Expired { delete_at });
        }
        Ok(())
    }

    fn verify_size(&self, file: &File, metadata: &Metadata) -> Result<u64> {
        let Some(value) = metadata::get(metadata, CONTENT_LENGTH) else {
            return Err(self.quarantine("missing content-length in metadata"));
        };
        let Ok(expected) = value.trim().parse::<u64>() else {
            return Err(self.quarantine(&format!("bad metadata content-length {value}")));
        };
        let actual = file.metadata()?.len();
        if expected != actual {
            return Err(self.quarantine(&format!(
                "metadata content-length {expected} does not match actual object size {actual}"
            )));
        }
        Ok(actual)
    }

    /// Start writing a new version.
    ///
    /// With a `size`, space is reserved up front and a volume that would
    /// drop below the configured reserve fails with [`Error::NoSpace`].
    pub fn create(self, size: Option<u64>) -> Result<DiskFileWriter> {
        let tmp_dir = self.device_path.join(self.policy.tmp_dir());
        let reserve = self.manager.config().fallocate_reserve;
        let pool = Arc::clone(&self.pool);
        let temp = pool.run(move || {
            fs::create_dir_all(&tmp_dir)?;
            let temp = NamedTempFile::new_in(&tmp_dir)?;
            if let Some(size) = size {
                if reserve > 0 && raw_io::free_space(&tmp_dir)?.saturating_sub(size) < reserve {
                    return Err(Error::NoSpace { required: size });
                }
                raw_io::fallocate(temp.as_file(), size).map_err(|e| Error::from_alloc(e, size))?;
            }
            Ok(temp)
        })?;
        DiskFileWriter::new(self, temp)
    }

    /// Commit a `.meta` overlay; `metadata` must carry `X-Timestamp`
    pub fn write_metadata(self, metadata: Metadata) -> Result<PathBuf> {
        self.create(None)?.put_as(metadata, FileKind::Meta)
    }

    /// Commit a tombstone at `timestamp`
    pub fn delete(self, timestamp: Timestamp) -> Result<PathBuf> {
        let metadata = Metadata::from([(X_TIMESTAMP.to_string(), timestamp.internal())]);
        self.create(None)?.put_as(metadata, FileKind::Tombstone)
    }

    /// Metadata of the current version without keeping it open
    pub fn read_metadata(self) -> Result<Metadata> {
        Ok(self.open()?.metadata)
    }
}

/// A verified object version with its data file held open
#[derive(Debug)]
pub struct OpenDiskFile {
    diskfile: DiskFile,
    file: File,
    data_file: PathBuf,
    meta_file: Option<PathBuf>,
    metadata: Metadata,
    timestamp: Timestamp,
    size: u64,
}

impl OpenDiskFile {
    /// Merged metadata of the data file and its `.meta` overlay
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    #[must_use]
    pub fn meta_file(&self) -> Option<&Path> {
        self.meta_file.as_deref()
    }

    /// Size of the data file, verified against `Content-Length`
    #[must_use]
    pub const fn content_length(&self) -> u64 {
        self.size
    }

    /// Timestamp of the data file
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[must_use]
    pub fn diskfile(&self) -> &DiskFile {
        &self.diskfile
    }

    /// Stream the object.
    ///
    /// The page cache is kept only when `keep_cache` is set and the object
    /// is smaller than the configured keep-cache size.
    #[must_use]
    pub fn reader(self, keep_cache: bool) -> DiskFileReader {
        let keep_cache = keep_cache && self.size < self.diskfile.manager.config().keep_cache_size;
        DiskFileReader::new(
            self.diskfile,
            self.file,
            self.data_file,
            self.metadata,
            self.size,
            keep_cache,
        )
    }

    /// Release the data file
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{DEVICE, policy0, test_manager};
    use crate::metadata::{ETAG, write_metadata};
    use tempfile::TempDir;

    fn object() -> ObjectName {
        ObjectName::new("a", "c", "o")
    }

    fn diskfile(manager: &DiskFileManager) -> DiskFile {
        manager
            .get_diskfile(DEVICE, "0", &object(), &policy0(manager))
            .unwrap()
    }

    /// Write a file with metadata straight into a hash directory
    fn plant(dir: &Path, filename: &str, body: &[u8], metadata: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(filename);
        fs::write(&path, body).unwrap();
        let metadata: Metadata = metadata
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        write_metadata(&File::open(&path).unwrap(), &path, &metadata).unwrap();
    }

    fn put(manager: &DiskFileManager, body: &[u8], ts: &str) -> PathBuf {
        let mut writer = diskfile(manager).create(Some(body.len() as u64)).unwrap();
        writer.write(body).unwrap();
        writer
            .put(Metadata::from([(X_TIMESTAMP.to_string(), ts.to_string())]))
            .unwrap()
    }

    fn setup() -> (TempDir, DiskFileManager, PathBuf) {
        let (root, manager) = test_manager(|_| {});
        let datadir = diskfile(&manager).datadir().to_path_buf();
        (root, manager, datadir)
    }

    #[test]
    fn test_layout_of_datadir() {
        let (root, manager, datadir) = setup();
        let hash = manager.hash_path(&object());
        assert_eq!(
            datadir,
            root.path()
                .join(DEVICE)
                .join("objects/0")
                .join(&hash[29..])
                .join(&hash)
        );
    }

    #[test]
    fn test_open_missing() {
        let (_root, manager, _) = setup();
        assert!(matches!(diskfile(&manager).open(), Err(Error::NotExist)));
        assert!(matches!(diskfile(&manager).lookup(), Ok(Lookup::Absent)));
    }

    #[test]
    fn test_put_then_open() {
        let (_root, manager, datadir) = setup();
        let path = put(&manager, b"hello world", "1000.00000");
        assert_eq!(path, datadir.join("0000001000.00000.data"));

        let open = diskfile(&manager).open().unwrap();
        assert_eq!(open.content_length(), 11);
        assert_eq!(open.metadata().get(NAME).unwrap(), "/a/c/o");
        assert_eq!(open.metadata().get(CONTENT_LENGTH).unwrap(), "11");
        assert_eq!(
            open.metadata().get(ETAG).unwrap(),
            &format!("{:x}", md5::compute(b"hello world"))
        );
        assert_eq!(open.timestamp(), "1000".parse().unwrap());
        assert!(open.meta_file().is_none());
    }

    #[test]
    fn test_meta_overlay_is_merged() {
        let (_root, manager, datadir) = setup();
        put(&manager, b"body", "1000");
        let mut overlay = Metadata::new();
        overlay.insert(X_TIMESTAMP.into(), "0000001001.00000".into());
        overlay.insert("X-Object-Meta-Color".into(), "blue".into());
        overlay.insert(CONTENT_LENGTH.into(), "999".into());
        let meta = diskfile(&manager).write_metadata(overlay).unwrap();
        assert_eq!(meta, datadir.join("0000001001.00000.meta"));

        let open = diskfile(&manager).open().unwrap();
        assert_eq!(open.data_file(), datadir.join("0000001000.00000.data"));
        assert_eq!(open.meta_file(), Some(meta.as_path()));
        assert_eq!(open.metadata()["X-Object-Meta-Color"], "blue");
        assert_eq!(open.metadata()[X_TIMESTAMP], "0000001001.00000");
        assert_eq!(open.metadata()[CONTENT_LENGTH], "4");
    }

    #[test]
    fn test_newer_tombstone_deletes() {
        let (_root, manager, datadir) = setup();
        put(&manager, b"body", "1000");
        fs::write(datadir.join("0000002000.00000.ts"), b"").unwrap();

        match diskfile(&manager).open() {
            Err(Error::Deleted { timestamp }) => assert_eq!(timestamp, "2000".parse().unwrap()),
            other => panic!("expected deleted, got {other:?}"),
        }
        // Both are long past the reclaim age
        let remaining = manager
            .cleanup(&datadir, &policy0(&manager), manager.config().reclaim_age())
            .unwrap();
        assert!(remaining.is_empty());
        assert!(!datadir.exists());

        // Committing an old tombstone cleans up the same way
        put(&manager, b"body", "1000");
        diskfile(&manager).delete("2000".parse().unwrap()).unwrap();
        assert!(!datadir.exists());
    }

    #[test]
    fn test_recent_tombstone_survives() {
        let (_root, manager, datadir) = setup();
        put(&manager, b"body", "1000");
        let now = Timestamp::now();
        diskfile(&manager).delete(now).unwrap();

        assert!(matches!(
            diskfile(&manager).lookup().unwrap(),
            Lookup::Deleted(ts) if ts == now
        ));
        assert_eq!(listdir(&datadir).unwrap(), vec![format!("{}.ts", now.internal())]);
    }

    #[test]
    fn test_size_mismatch_quarantines() {
        let (root, manager, datadir) = setup();
        plant(
            &datadir,
            "0000001000.00000.data",
            &[b'x'; 51],
            &[
                (NAME, "/a/c/o"),
                (X_TIMESTAMP, "0000001000.00000"),
                (CONTENT_LENGTH, "50"),
            ],
        );

        match diskfile(&manager).open() {
            Err(Error::Quarantined { reason }) => assert_eq!(
                reason,
                "metadata content-length 50 does not match actual object size 51"
            ),
            other => panic!("expected quarantine, got {other:?}"),
        }
        assert!(!datadir.exists());
        let hash = manager.hash_path(&object());
        assert!(
            root.path()
                .join(DEVICE)
                .join("quarantined/objects")
                .join(hash)
                .join("0000001000.00000.data")
                .exists()
        );
        assert!(matches!(diskfile(&manager).open(), Err(Error::NotExist)));
    }

    #[test]
    fn test_matching_size_is_not_quarantined() {
        let (_root, manager, datadir) = setup();
        plant(
            &datadir,
            "0000001000.00000.data",
            &[b'x'; 50],
            &[(NAME, "/a/c/o"), (CONTENT_LENGTH, "50")],
        );
        assert_eq!(diskfile(&manager).open().unwrap().content_length(), 50);
        assert_eq!(manager.stats().quarantines.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn test_missing_metadata_quarantines() {
        let (_root, manager, datadir) = setup();
        fs::create_dir_all(&datadir).unwrap();
        fs::write(datadir.join("0000001000.00000.data"), b"x").unwrap();
        assert!(matches!(
            diskfile(&manager).lookup().unwrap(),
            Lookup::Corrupt(reason) if reason.starts_with("Exception reading metadata")
        ));
    }

    #[test]
    fn test_file_in_place_of_datadir() {
        let (_root, manager, datadir) = setup();
        fs::create_dir_all(datadir.parent().unwrap()).unwrap();
        fs::write(&datadir, b"junk").unwrap();
        match diskfile(&manager).open() {
            Err(Error::Quarantined { reason }) => {
                assert!(reason.starts_with("Expected directory, found file at"));
            }
            other => panic!("expected quarantine, got {other:?}"),
        }
        assert!(!datadir.exists());
    }

    #[test]
    fn test_name_collision() {
        let (_root, manager, datadir) = setup();
        plant(
            &datadir,
            "0000001000.00000.data",
            b"",
            &[(NAME, "/a/c/other"), (CONTENT_LENGTH, "0")],
        );
        assert!(matches!(
            diskfile(&manager).open(),
            Err(Error::Collision { ref stored, .. }) if stored == "/a/c/other"
        ));
        // Collision is not corruption
        assert!(datadir.exists());
    }

    #[test]
    fn test_open_by_hash_recovers_name() {
        let (_root, manager, _) = setup();
        put(&manager, b"body", "1000");
        let hash = manager.hash_path(&object());
        let diskfile = manager
            .get_diskfile_from_hash(DEVICE, "0", &hash, &policy0(&manager))
            .unwrap();
        assert_eq!(diskfile.name(), Some(&object()));
        let open = diskfile.open().unwrap();
        assert_eq!(open.diskfile().name(), Some(&object()));
    }

    #[test]
    fn test_open_by_hash_recovers_name_from_tombstone() {
        let (_root, manager, datadir) = setup();
        put(&manager, b"body", "1000");
        let now = Timestamp::now();
        diskfile(&manager).delete(now).unwrap();
        assert_eq!(listdir(&datadir).unwrap(), vec![format!("{}.ts", now.internal())]);

        let hash = manager.hash_path(&object());
        let diskfile = manager
            .get_diskfile_from_hash(DEVICE, "0", &hash, &policy0(&manager))
            .unwrap();
        assert_eq!(diskfile.name(), Some(&object()));
        assert!(matches!(
            diskfile.open(),
            Err(Error::Deleted { timestamp }) if timestamp == now
        ));
    }

    #[test]
    fn test_open_by_hash_missing_or_invalid() {
        let (_root, manager, _) = setup();
        let policy = policy0(&manager);
        let err = manager
            .get_diskfile_from_hash(DEVICE, "0", "ffffffffffffffffffffffffffffffff", &policy)
            .unwrap_err();
        assert!(matches!(err, Error::NotExist));

        for hash in ["", "../../..", "abc/def", "a\u{e9}\u{e9}"] {
            let err = manager
                .get_diskfile_from_hash(DEVICE, "0", hash, &policy)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{hash:?}: {err:?}");
        }
    }

    #[test]
    fn test_open_by_hash_empty_after_cleanup() {
        let (_root, manager, datadir) = setup();
        // Long past the reclaim age
        plant(&datadir, "0000001000.00000.ts", b"", &[(NAME, "/a/c/o")]);
        let hash = manager.hash_path(&object());
        let err = manager
            .get_diskfile_from_hash(DEVICE, "0", &hash, &policy0(&manager))
            .unwrap_err();
        assert!(matches!(err, Error::NotExist));
        assert!(!datadir.exists());
    }

    #[test]
    fn test_open_by_hash_quarantines_file_in_place_of_datadir() {
        let (root, manager, datadir) = setup();
        fs::create_dir_all(datadir.parent().unwrap()).unwrap();
        fs::write(&datadir, b"junk").unwrap();
        let hash = manager.hash_path(&object());
        let err = manager
            .get_diskfile_from_hash(DEVICE, "0", &hash, &policy0(&manager))
            .unwrap_err();
        assert!(matches!(err, Error::NotExist));
        assert!(!datadir.exists());
        assert!(
            root.path()
                .join(DEVICE)
                .join("quarantined/objects")
                .join(&hash)
                .is_file()
        );
    }

    #[test]
    fn test_open_by_hash_rejects_foreign_name() {
        let (root, manager, _) = setup();
        let hash = "00000000000000000000000000000abc";
        let policy = policy0(&manager);
        let datadir = storage_directory(&root.path().join(DEVICE).join("objects"), "0", hash);
        plant(&datadir, "0000001000.00000.data", b"", &[(NAME, "/a/c/o"), (CONTENT_LENGTH, "0")]);

        let err = manager
            .get_diskfile_from_hash(DEVICE, "0", hash, &policy)
            .unwrap_err();
        assert!(err.is_quarantined());
        assert!(!datadir.exists());
    }

    #[test]
    fn test_expired() {
        let (_root, manager, datadir) = setup();
        plant(
            &datadir,
            "0000001000.00000.data",
            b"",
            &[(NAME, "/a/c/o"), (CONTENT_LENGTH, "0"), (X_DELETE_AT, "1500")],
        );
        assert!(matches!(
            diskfile(&manager).open(),
            Err(Error::Expired { delete_at }) if delete_at == "1500".parse().unwrap()
        ));

        let later = (Timestamp::now().as_secs() + 3600).to_string();
        let meta = Metadata::from([
            (X_TIMESTAMP.to_string(), "0000001001.00000".to_string()),
            (X_DELETE_AT.to_string(), later),
        ]);
        diskfile(&manager).write_metadata(meta).unwrap();
        assert!(diskfile(&manager).open().is_ok());
    }

    #[test]
    fn test_bad_delete_at_quarantines() {
        let (_root, manager, datadir) = setup();
        plant(
            &datadir,
            "0000001000.00000.data",
            b"",
            &[(NAME, "/a/c/o"), (CONTENT_LENGTH, "0"), (X_DELETE_AT, "soon")],
        );
        assert!(diskfile(&manager).open().unwrap_err().is_quarantined());
    }

    #[test]
    fn test_no_space_leaves_no_temp_file() {
        let (root, manager) = test_manager(|c| c.fallocate_reserve = u64::MAX);
        let err = diskfile(&manager).create(Some(1024)).unwrap_err();
        assert!(matches!(err, Error::NoSpace { required: 1024 }));
        let tmp = root.path().join(DEVICE).join("tmp");
        assert_eq!(fs::read_dir(tmp).unwrap().count(), 0);
    }

    #[test]
    fn test_put_requires_timestamp() {
        let (root, manager, datadir) = setup();
        let mut writer = diskfile(&manager).create(None).unwrap();
        writer.write(b"abc").unwrap();
        let err = writer.put(Metadata::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!datadir.exists());
        assert_eq!(fs::read_dir(root.path().join(DEVICE).join("tmp")).unwrap().count(), 0);
    }
}

//! Diskfile manager
//!
//! Owns everything shared between diskfiles on one node:
//! - device path resolution and mount checks
//! - one I/O thread pool per device
//! - the per-device replication lock
//! - hash directory cleanup and quarantine
//! - pending container updates
//!
//! Suffix hashing lives in [`crate::hashes`] and iteration in
//! [`crate::location`]; both extend this type.

use crate::diskfile::DiskFile;
use crate::fileset::{self, FilesetLayout, OnDiskFile, ReclaimCategory};
use crate::location::AuditLocation;
use crate::lock::{DirLock, lock_path};
use crate::metadata::{self, NAME};
use crate::policy::{StoragePolicy, StoragePolicyCollection};
use crate::quarantine::quarantine_renamer;
use crate::raw_io;
use crate::threadpool::ThreadPool;
use objectio_common::{
    DiskFileConfig, Error, HashPathConfig, Metadata, ObjectName, Result, Timestamp, hash_suffix,
    is_valid_hash, storage_directory,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Manager statistics
#[derive(Debug, Default)]
pub struct DiskFileStats {
    pub quarantines: AtomicU64,
    pub async_pendings: AtomicU64,
    pub suffixes_hashed: AtomicU64,
    pub files_reclaimed: AtomicU64,
    pub hash_cache_conflicts: AtomicU64,
}

/// Container update that could not be delivered, kept for a later retry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncUpdate {
    pub op: String,
    pub account: String,
    pub container: String,
    pub obj: String,
    pub headers: Metadata,
}

/// Held per-device replication lock; a no-op when locking is disabled
#[derive(Debug)]
pub struct ReplicationLock {
    _lock: Option<DirLock>,
}

impl ReplicationLock {
    /// Whether a real lock is held
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self._lock.is_some()
    }
}

struct Inner {
    config: DiskFileConfig,
    hash_path: HashPathConfig,
    policies: StoragePolicyCollection,
    pools: Mutex<HashMap<String, Arc<ThreadPool>>>,
    stats: DiskFileStats,
    use_splice: bool,
}

/// Entry point for all object storage on the local devices
#[derive(Clone)]
pub struct DiskFileManager {
    inner: Arc<Inner>,
}

/// Whether `path` is a mount point.
///
/// A symlink never is. Otherwise the path is a mount point when it lives on
/// a different device than its parent, or is its own parent (`/`).
#[must_use]
pub fn is_mount(path: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if meta.file_type().is_symlink() {
        return false;
    }
    let Ok(parent) = fs::symlink_metadata(path.join("..")) else {
        return false;
    };
    meta.dev() != parent.dev() || meta.ino() == parent.ino()
}

/// Names in a directory, unsorted
pub(crate) fn listdir(path: &Path) -> io::Result<Vec<String>> {
    fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect()
}

/// Names in a directory, sorted; empty if it cannot be listed
pub(crate) fn listdir_sorted(path: &Path) -> Vec<String> {
    let mut names = listdir(path).unwrap_or_default();
    names.sort_unstable();
    names
}

pub(crate) fn is_not_dir(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOTDIR)
}

impl DiskFileManager {
    /// Create a manager over `config.devices`
    #[must_use]
    pub fn new(
        config: DiskFileConfig,
        hash_path: HashPathConfig,
        policies: StoragePolicyCollection,
    ) -> Self {
        let use_splice = if !config.splice {
            false
        } else if raw_io::splice_supported() {
            info!("Using zero-copy sendfile for object reads");
            true
        } else {
            warn!("Zero-copy reads requested but unsupported on this platform; using buffered reads");
            false
        };

        Self {
            inner: Arc::new(Inner {
                config,
                hash_path,
                policies,
                pools: Mutex::new(HashMap::new()),
                stats: DiskFileStats::default(),
                use_splice,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DiskFileConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn policies(&self) -> &StoragePolicyCollection {
        &self.inner.policies
    }

    #[must_use]
    pub fn stats(&self) -> &DiskFileStats {
        &self.inner.stats
    }

    pub(crate) fn use_splice(&self) -> bool {
        self.inner.use_splice
    }

    /// Hash directory name for an object
    #[must_use]
    pub fn hash_path(&self, name: &ObjectName) -> String {
        self.inner.hash_path.hash_path(name)
    }

    /// Path of a device, or `None` if it is unavailable.
    ///
    /// `mount_check` overrides the configured check. Without a mount check
    /// the device only has to be an existing directory.
    #[must_use]
    pub fn get_dev_path(&self, device: &str, mount_check: Option<bool>) -> Option<PathBuf> {
        if device.is_empty() || device == "." || device == ".." || device.contains('/') {
            return None;
        }
        let path = self.inner.config.devices.join(device);
        let available = if mount_check.unwrap_or(self.inner.config.mount_check) {
            is_mount(&path)
        } else {
            path.is_dir()
        };
        available.then_some(path)
    }

    pub(crate) fn require_dev_path(&self, device: &str, mount_check: Option<bool>) -> Result<PathBuf> {
        self.get_dev_path(device, mount_check)
            .ok_or_else(|| Error::DeviceUnavailable(device.to_string()))
    }

    /// The I/O pool of a device, started on first use
    pub(crate) fn pool(&self, device: &str) -> Result<Arc<ThreadPool>> {
        let mut pools = self.inner.pools.lock();
        if let Some(pool) = pools.get(device) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(ThreadPool::new(device, self.inner.config.threads_per_disk)?);
        pools.insert(device.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Diskfile for a known object identity
    pub fn get_diskfile(
        &self,
        device: &str,
        partition: &str,
        name: &ObjectName,
        policy: &Arc<StoragePolicy>,
    ) -> Result<DiskFile> {
        let device_path = self.require_dev_path(device, None)?;
        let hash = self.hash_path(name);
        Ok(DiskFile::new(
            self.clone(),
            device,
            device_path,
            partition,
            hash,
            Some(name.clone()),
            Arc::clone(policy),
            self.pool(device)?,
        ))
    }

    /// Diskfile for an existing hash directory.
    ///
    /// The directory is cleaned up first and the identity is recovered from
    /// the newest surviving file, tombstones included. Nothing left, or no
    /// readable name, is [`Error::NotExist`]. A file in place of the
    /// directory is quarantined and also reported as [`Error::NotExist`].
    pub fn get_diskfile_from_hash(
        &self,
        device: &str,
        partition: &str,
        hash: &str,
        policy: &Arc<StoragePolicy>,
    ) -> Result<DiskFile> {
        check_hash(hash)?;
        let device_path = self.require_dev_path(device, None)?;
        let pool = self.pool(device)?;
        let datadir = storage_directory(&device_path.join(policy.data_dir()), partition, hash);

        let manager = self.clone();
        let root = device_path.clone();
        let data_dir = policy.data_dir();
        let layout = policy.layout();
        let expected = hash.to_string();
        let name = pool.run(move || {
            manager.recover_name(&root, &datadir, &data_dir, layout, &expected)
        })?;

        Ok(DiskFile::new(
            self.clone(),
            device,
            device_path,
            partition,
            hash.to_string(),
            Some(name),
            Arc::clone(policy),
            pool,
        ))
    }

    fn recover_name(
        &self,
        device_path: &Path,
        datadir: &Path,
        data_dir: &str,
        layout: &'static dyn FilesetLayout,
        hash: &str,
    ) -> Result<ObjectName> {
        let files = match self.cleanup_blocking(datadir, layout, self.config().reclaim_age()) {
            Ok(files) => files,
            Err(Error::NotADirectory(_)) => {
                let reason = format!("Expected directory, found file at {}", datadir.display());
                let err = self.quarantine_blocking(device_path, datadir, data_dir, &reason);
                if !err.is_quarantined() {
                    warn!("{}: {}", reason, err);
                }
                return Err(Error::NotExist);
            }
            Err(e) => return Err(e),
        };

        // Markers such as `.durable` carry no metadata; keep going
        for filename in &files {
            let path = datadir.join(filename);
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let stored = match metadata::read_metadata(&file, &path) {
                Ok(stored) => stored,
                Err(Error::Metadata(msg)) => {
                    debug!("Skipping {}: {}", path.display(), msg);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(name) = metadata::get(&stored, NAME).and_then(|n| ObjectName::parse(n).ok())
            else {
                return Err(Error::NotExist);
            };
            if self.hash_path(&name) != hash {
                let reason = format!("name metadata {} does not hash to {hash}", name.path());
                return Err(self.quarantine_blocking(device_path, datadir, data_dir, &reason));
            }
            return Ok(name);
        }
        Err(Error::NotExist)
    }

    /// Diskfile for a location produced by the audit walk.
    ///
    /// The walk already checked the mount, so only the device directory is
    /// checked here. The walked path is used as the hash directory as is.
    pub fn get_diskfile_from_audit_location(&self, location: &AuditLocation) -> Result<DiskFile> {
        let device_path = self.require_dev_path(&location.device, Some(false))?;
        let hash = location
            .path
            .file_name()
            .map(|h| h.to_string_lossy().into_owned())
            .ok_or_else(|| Error::invalid_argument(format!("bad audit location {location}")))?;
        check_hash(&hash)?;
        Ok(DiskFile::new(
            self.clone(),
            &location.device,
            device_path,
            &location.partition,
            hash,
            None,
            Arc::clone(&location.policy),
            self.pool(&location.device)?,
        )
        .with_datadir(location.path.clone()))
    }

    /// Take the device's replication lock.
    ///
    /// Only enforced with `replication_one_per_device`; times out with the
    /// retryable [`Error::ReplicationLockTimeout`].
    pub fn replication_lock(&self, device: &str) -> Result<ReplicationLock> {
        if !self.inner.config.replication_one_per_device {
            return Ok(ReplicationLock { _lock: None });
        }
        let device_path = self.require_dev_path(device, None)?;
        match lock_path(&device_path, self.inner.config.replication_lock_timeout()) {
            Ok(lock) => Ok(ReplicationLock { _lock: Some(lock) }),
            Err(Error::LockTimeout { path, timeout }) => {
                Err(Error::ReplicationLockTimeout { path, timeout })
            }
            Err(e) => Err(e),
        }
    }

    /// The I/O pool of the device a path lives on
    pub(crate) fn pool_for_path(&self, path: &Path) -> Result<Arc<ThreadPool>> {
        let device = path
            .strip_prefix(&self.inner.config.devices)
            .ok()
            .and_then(|rel| match rel.components().next() {
                Some(Component::Normal(device)) => device.to_str(),
                _ => None,
            })
            .ok_or_else(|| {
                Error::invalid_argument(format!("{} is not on a device", path.display()))
            })?;
        self.pool(device)
    }

    /// Resolve a hash directory and unlink what is no longer needed.
    ///
    /// Obsolete files go immediately; the tombstone and possible-reclaim
    /// files go once the layout deems them reclaimable at `reclaim_age`.
    /// Returns the surviving filenames, newest first. An emptied directory
    /// is removed. A file where the directory should be is reported as
    /// [`Error::NotADirectory`]. Runs on the I/O pool of the device.
    pub fn cleanup(
        &self,
        hash_dir: &Path,
        policy: &StoragePolicy,
        reclaim_age: Duration,
    ) -> Result<Vec<String>> {
        let manager = self.clone();
        let layout = policy.layout();
        let hash_dir = hash_dir.to_path_buf();
        self.pool_for_path(&hash_dir)?
            .run(move || manager.cleanup_blocking(&hash_dir, layout, reclaim_age))
    }

    pub(crate) fn cleanup_blocking(
        &self,
        hash_dir: &Path,
        layout: &'static dyn FilesetLayout,
        reclaim_age: Duration,
    ) -> Result<Vec<String>> {
        let files = match listdir(hash_dir) {
            Ok(files) => files,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) if is_not_dir(&e) => return Err(Error::NotADirectory(hash_dir.to_path_buf())),
            Err(e) => return Err(e.into()),
        };

        let fileset = fileset::resolve(layout, &files, None)?;
        let now = Timestamp::now();
        let mut removed = HashSet::new();

        let categorized = fileset
            .obsolete
            .iter()
            .map(|f| (f, ReclaimCategory::Obsolete))
            .chain(fileset.ts_file.iter().map(|f| (f, ReclaimCategory::Tombstone)))
            .chain(
                fileset
                    .possible_reclaim
                    .iter()
                    .map(|f| (f, ReclaimCategory::PossibleReclaim)),
            );
        for (file, category) in categorized {
            if !layout.is_reclaimable(category, file.timestamp.age(now), reclaim_age) {
                continue;
            }
            if self.unlink(hash_dir, file) {
                removed.insert(file.filename.as_str());
            }
        }

        let mut remaining: Vec<String> = files
            .iter()
            .filter(|f| !removed.contains(f.as_str()))
            .cloned()
            .collect();
        remaining.sort_unstable_by(|a, b| b.cmp(a));

        if remaining.is_empty() {
            if let Err(e) = fs::remove_dir(hash_dir) {
                debug!("Could not remove empty {}: {}", hash_dir.display(), e);
            }
        }
        Ok(remaining)
    }

    fn unlink(&self, hash_dir: &Path, file: &OnDiskFile) -> bool {
        match fs::remove_file(hash_dir.join(&file.filename)) {
            Ok(()) => {
                self.inner.stats.files_reclaimed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                warn!(
                    "Failed to remove {} from {}: {}",
                    file.filename,
                    hash_dir.display(),
                    e
                );
                false
            }
        }
    }

    /// Move a corrupt unit aside and return the error to surface.
    ///
    /// Yields [`Error::Quarantined`] unless the rename itself hit a
    /// filesystem error, which is returned instead. Runs on the I/O pool of
    /// the device.
    pub fn quarantine(
        &self,
        device_path: &Path,
        unit: &Path,
        policy: &StoragePolicy,
        reason: &str,
    ) -> Error {
        let manager = self.clone();
        let device_path = device_path.to_path_buf();
        let target = unit.to_path_buf();
        let data_dir = policy.data_dir();
        let owned_reason = reason.to_string();
        let pooled = self.pool_for_path(unit).and_then(|pool| {
            pool.run(move || {
                Ok(manager.quarantine_blocking(&device_path, &target, &data_dir, &owned_reason))
            })
        });
        match pooled {
            Ok(err) | Err(err) => err,
        }
    }

    pub(crate) fn quarantine_blocking(
        &self,
        device_path: &Path,
        unit: &Path,
        data_dir: &str,
        reason: &str,
    ) -> Error {
        match quarantine_renamer(device_path, unit, data_dir) {
            Ok(target) => {
                self.inner.stats.quarantines.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Quarantined {} to {}: {}",
                    unit.display(),
                    target.display(),
                    reason
                );
                if let Some(suffix_dir) = unit.parent() {
                    if let Err(e) = self.invalidate_hash_blocking(suffix_dir) {
                        warn!("Failed to invalidate {}: {}", suffix_dir.display(), e);
                    }
                }
                Error::quarantined(reason)
            }
            Err(Error::DiskIo(e)) if e.kind() == ErrorKind::NotFound => {
                debug!("{} already moved: {}", unit.display(), reason);
                Error::quarantined(reason)
            }
            Err(e) => {
                error!("Failed to quarantine {}: {}", unit.display(), e);
                e
            }
        }
    }

    /// Persist a container update for later delivery.
    ///
    /// Stored as `async_pending[-N]/<suffix>/<hash>-<timestamp>`.
    pub fn write_async_update(
        &self,
        device: &str,
        update: &AsyncUpdate,
        timestamp: Timestamp,
        policy: &StoragePolicy,
    ) -> Result<PathBuf> {
        let device_path = self.require_dev_path(device, None)?;
        let name = ObjectName::new(&update.account, &update.container, &update.obj);
        let hash = self.hash_path(&name);
        let dir = device_path
            .join(policy.async_dir())
            .join(hash_suffix(&hash));
        let tmp_dir = device_path.join(policy.tmp_dir());
        let target = dir.join(format!("{hash}-{}", timestamp.internal()));
        let encoded = serde_json::to_vec(update)
            .map_err(|e| Error::internal(format!("encode async update: {e}")))?;

        let path = target.clone();
        self.pool(device)?.run(move || {
            fs::create_dir_all(&tmp_dir)?;
            fs::create_dir_all(&dir)?;
            let mut temp = tempfile::NamedTempFile::new_in(&tmp_dir)?;
            io::Write::write_all(&mut temp, &encoded)
                .map_err(|e| Error::from_alloc(e, encoded.len() as u64))?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| Error::DiskIo(e.error))?;
            raw_io::fsync_dir(&dir)?;
            Ok(())
        })?;

        self.inner.stats.async_pendings.fetch_add(1, Ordering::Relaxed);
        debug!("Saved async update {} {} to {}", update.op, name, target.display());
        Ok(target)
    }
}

fn check_hash(hash: &str) -> Result<()> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!("invalid object hash {hash:?}")))
    }
}

impl std::fmt::Debug for DiskFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFileManager")
            .field("devices", &self.inner.config.devices)
            .field("policies", &self.inner.policies.len())
            .finish()
    }
}

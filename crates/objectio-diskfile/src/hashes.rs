//! Partition suffix hashes
//!
//! Each partition keeps `hashes.json`, a map from suffix name to the MD5 of
//! the filenames below it, or `null` once a write invalidated it. Replicators
//! compare these maps between nodes to find suffixes that need syncing.
//!
//! Recomputing runs without the partition lock. The lock is only taken to
//! commit, and the commit is refused if the file changed since it was read,
//! in which case the whole pass is retried.

use crate::fileset::FilesetLayout;
use crate::lock::lock_path;
use crate::manager::{DiskFileManager, is_not_dir, listdir, listdir_sorted};
use crate::policy::StoragePolicy;
use objectio_common::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

/// Name of the cache file inside each partition directory
pub const HASH_FILE: &str = "hashes.json";

const PARTITION_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Suffix name to digest; `None` means the suffix must be rehashed
pub type SuffixHashes = BTreeMap<String, Option<String>>;

/// Identity of one version of the cache file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CacheStamp {
    modified: SystemTime,
    ino: u64,
    len: u64,
}

impl CacheStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            ino: meta.ino(),
            len: meta.len(),
        })
    }
}

/// Whether a partition entry names a suffix directory
pub(crate) fn is_suffix(name: &str) -> bool {
    name.len() == 3 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Snapshot of a partition's cache, committed only if nobody else wrote it
#[derive(Debug)]
pub(crate) struct HashCache {
    partition: PathBuf,
    pub(crate) hashes: SuffixHashes,
    stamp: Option<CacheStamp>,
    valid: bool,
}

impl HashCache {
    /// Read the cache; a missing or unreadable file loads as invalid
    pub(crate) fn load(partition: &Path) -> Self {
        let path = partition.join(HASH_FILE);
        // Stamp first: a write racing the read then shows up as a conflict
        let stamp = CacheStamp::of(&path);
        let hashes = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<SuffixHashes>(&bytes).ok());
        Self {
            partition: partition.to_path_buf(),
            valid: hashes.is_some(),
            hashes: hashes.unwrap_or_default(),
            stamp,
        }
    }

    /// Write the snapshot if the file is unchanged since [`Self::load`].
    ///
    /// Returns `false` on conflict.
    pub(crate) fn commit(&self) -> Result<bool> {
        let _lock = lock_path(&self.partition, PARTITION_LOCK_TIMEOUT)?;
        if CacheStamp::of(&self.partition.join(HASH_FILE)) != self.stamp {
            return Ok(false);
        }
        write_hashes(&self.partition, &self.hashes)?;
        Ok(true)
    }
}

fn write_hashes(partition: &Path, hashes: &SuffixHashes) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new_in(partition)?;
    serde_json::to_writer(&mut temp, hashes)
        .map_err(|e| Error::internal(format!("encode {HASH_FILE}: {e}")))?;
    temp.as_file().sync_all()?;
    temp.persist(partition.join(HASH_FILE))
        .map_err(|e| Error::DiskIo(e.error))?;
    Ok(())
}

impl DiskFileManager {
    /// Suffix hashes of a partition, recomputing what is invalid.
    ///
    /// `recalculate` forces the named suffixes to be rehashed and
    /// `do_listdir` rediscovers suffixes from the directory listing.
    /// Returns how many suffixes were hashed along with the full map. A
    /// missing partition yields `(0, {})`. Runs on the I/O pool of the
    /// device.
    pub fn get_hashes(
        &self,
        device: &str,
        partition: &str,
        policy: &StoragePolicy,
        recalculate: &[String],
        do_listdir: bool,
    ) -> Result<(usize, SuffixHashes)> {
        let device_path = self.require_dev_path(device, None)?;
        let partition_path = device_path.join(policy.data_dir()).join(partition);
        let manager = self.clone();
        let layout = policy.layout();
        let recalculate = recalculate.to_vec();
        self.pool(device)?.run(move || {
            manager.get_partition_hashes(&partition_path, layout, &recalculate, do_listdir)
        })
    }

    /// [`Self::get_hashes`] for an already resolved partition directory
    pub(crate) fn get_partition_hashes(
        &self,
        partition_path: &Path,
        layout: &'static dyn FilesetLayout,
        recalculate: &[String],
        do_listdir: bool,
    ) -> Result<(usize, SuffixHashes)> {
        if !partition_path.is_dir() {
            return Ok((0, SuffixHashes::new()));
        }
        let reclaim_age = self.config().reclaim_age();

        loop {
            let mut cache = HashCache::load(partition_path);
            let mut modified = false;

            if !cache.valid || do_listdir {
                for name in listdir_sorted(partition_path) {
                    if is_suffix(&name) {
                        cache.hashes.entry(name).or_insert(None);
                    }
                }
                modified = true;
            }
            for suffix in recalculate.iter().filter(|s| is_suffix(s)) {
                cache.hashes.insert(suffix.clone(), None);
            }

            let pending: Vec<String> = cache
                .hashes
                .iter()
                .filter(|(_, digest)| digest.is_none())
                .map(|(suffix, _)| suffix.clone())
                .collect();
            let mut hashed = 0;
            for suffix in pending {
                modified = true;
                match self.hash_suffix_dir(&partition_path.join(&suffix), layout, reclaim_age) {
                    Ok(digest) => {
                        cache.hashes.insert(suffix, Some(digest));
                        hashed += 1;
                    }
                    Err(Error::NotADirectory(_)) => {
                        cache.hashes.remove(&suffix);
                    }
                    Err(e) => error!(
                        "Error hashing suffix {} in {}: {}",
                        suffix,
                        partition_path.display(),
                        e
                    ),
                }
            }

            if !modified || cache.commit()? {
                self.stats()
                    .suffixes_hashed
                    .fetch_add(hashed as u64, Ordering::Relaxed);
                return Ok((hashed, cache.hashes));
            }
            self.stats()
                .hash_cache_conflicts
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                "{} changed while hashing; retrying",
                partition_path.join(HASH_FILE).display()
            );
        }
    }

    /// Clean up every hash directory below a suffix and digest what is left.
    ///
    /// A file where a hash directory should be is quarantined. If nothing
    /// survives the suffix directory is removed and
    /// [`Error::NotADirectory`] is returned so the caller drops the entry.
    pub(crate) fn hash_suffix_dir(
        &self,
        suffix_dir: &Path,
        layout: &'static dyn FilesetLayout,
        reclaim_age: Duration,
    ) -> Result<String> {
        let mut names = match listdir(suffix_dir) {
            Ok(names) => names,
            Err(e) if e.kind() == ErrorKind::NotFound || is_not_dir(&e) => {
                return Err(Error::NotADirectory(suffix_dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        names.sort_unstable();

        let mut md5 = md5::Context::new();
        for hash in names {
            let hash_dir = suffix_dir.join(&hash);
            let files = match self.cleanup_blocking(&hash_dir, layout, reclaim_age) {
                Ok(files) => files,
                Err(Error::NotADirectory(_)) => {
                    if let Some((device_path, data_dir)) = split_suffix_dir(suffix_dir) {
                        let reason = format!(
                            "Expected directory, found file at {}",
                            hash_dir.display()
                        );
                        let err =
                            self.quarantine_blocking(device_path, &hash_dir, &data_dir, &reason);
                        if !err.is_quarantined() {
                            warn!("{}: {}", reason, err);
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            for file in &files {
                md5.consume(file.as_bytes());
            }
        }

        match fs::remove_dir(suffix_dir) {
            Ok(()) => return Err(Error::NotADirectory(suffix_dir.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotADirectory(suffix_dir.to_path_buf()));
            }
            Err(_) => {}
        }
        Ok(format!("{:x}", md5.compute()))
    }

    /// Mark one suffix for rehashing in its partition's cache.
    ///
    /// A partition without a cache is left alone; the next
    /// [`Self::get_hashes`] lists it from scratch anyway. Runs on the I/O
    /// pool of the device.
    pub fn invalidate_hash(&self, suffix_dir: &Path) -> Result<()> {
        let manager = self.clone();
        let owned = suffix_dir.to_path_buf();
        self.pool_for_path(suffix_dir)?
            .run(move || manager.invalidate_hash_blocking(&owned))
    }

    pub(crate) fn invalidate_hash_blocking(&self, suffix_dir: &Path) -> Result<()> {
        let (Some(suffix), Some(partition)) = (suffix_dir.file_name(), suffix_dir.parent()) else {
            return Ok(());
        };
        let suffix = suffix.to_string_lossy().into_owned();
        let path = partition.join(HASH_FILE);
        if !path.exists() {
            return Ok(());
        }

        let _lock = lock_path(partition, PARTITION_LOCK_TIMEOUT)?;
        let Some(mut hashes) = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<SuffixHashes>(&bytes).ok())
        else {
            return Ok(());
        };
        if hashes.get(&suffix) == Some(&None) {
            return Ok(());
        }
        hashes.insert(suffix, None);
        write_hashes(partition, &hashes)
    }
}

/// `<device>/<data dir>/<partition>/<suffix>` to `(<device>, <data dir>)`
fn split_suffix_dir(suffix_dir: &Path) -> Option<(&Path, String)> {
    let data_dir = suffix_dir.parent()?.parent()?;
    let name = data_dir.file_name()?.to_string_lossy().into_owned();
    Some((data_dir.parent()?, name))
}

//! Walking the object tree
//!
//! Lazy iterators over suffixes and hash directories, for replication, and
//! over every hash directory on the node, for auditing.

use crate::fileset::{self, FilesetLayout};
use crate::hashes::is_suffix;
use crate::manager::{DiskFileManager, is_mount, listdir_sorted};
use crate::policy::StoragePolicy;
use objectio_common::{Result, Timestamp, is_valid_hash};
use rand::seq::SliceRandom;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// One hash directory found on disk
#[derive(Clone, Debug)]
pub struct AuditLocation {
    /// Hash directory
    pub path: PathBuf,
    pub device: String,
    pub partition: String,
    pub policy: Arc<StoragePolicy>,
}

impl fmt::Display for AuditLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (device {}, partition {}, policy {})",
            self.path.display(),
            self.device,
            self.partition,
            self.policy.index()
        )
    }
}

/// Current state of one hash directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashEntry {
    pub path: PathBuf,
    pub hash: String,
    /// Timestamp of the data file or tombstone
    pub ts_data: Timestamp,
    /// Timestamp of the `.meta` overlay, if any
    pub ts_meta: Option<Timestamp>,
}

impl DiskFileManager {
    /// Suffix directories of a partition as `(path, suffix)`
    pub fn yield_suffixes(
        &self,
        device: &str,
        partition: &str,
        policy: &StoragePolicy,
    ) -> Result<impl Iterator<Item = (PathBuf, String)> + use<>> {
        let partition_path = self
            .require_dev_path(device, None)?
            .join(policy.data_dir())
            .join(partition);
        let listed = partition_path.clone();
        let suffixes = self.pool(device)?.run(move || Ok(list_suffixes(&listed)))?;
        Ok(suffixes
            .into_iter()
            .map(move |suffix| (partition_path.join(&suffix), suffix)))
    }

    /// Every hash directory of a partition, or of the given suffixes only.
    ///
    /// Directories without data or tombstone, or whose listing does not
    /// resolve, are skipped, as are given names that are not suffixes.
    /// Each suffix is listed by one job on the device's I/O pool.
    pub fn yield_hashes(
        &self,
        device: &str,
        partition: &str,
        policy: &StoragePolicy,
        suffixes: Option<Vec<String>>,
    ) -> Result<impl Iterator<Item = HashEntry> + use<>> {
        let partition_path = self
            .require_dev_path(device, None)?
            .join(policy.data_dir())
            .join(partition);
        let pool = self.pool(device)?;
        let suffixes = match suffixes {
            Some(mut suffixes) => {
                suffixes.retain(|s| is_suffix(s));
                suffixes
            }
            None => {
                let listed = partition_path.clone();
                pool.run(move || Ok(list_suffixes(&listed)))?
            }
        };
        let layout = policy.layout();

        Ok(suffixes.into_iter().flat_map(move |suffix| {
            let suffix_path = partition_path.join(suffix);
            let listed = suffix_path.clone();
            pool.run(move || Ok(hash_entries(&listed, layout)))
                .unwrap_or_else(|e| {
                    warn!("Failed to list {}: {}", suffix_path.display(), e);
                    Vec::new()
                })
        }))
    }

    /// Every hash directory on the node, for auditing.
    ///
    /// Devices are visited in random order so concurrent auditors spread
    /// their load. Unmounted devices are skipped when mount checking is on.
    /// `device_dirs` restricts the walk to the named devices. Listings run
    /// on each device's I/O pool, one job per partition.
    pub fn object_audit_location_generator(
        &self,
        device_dirs: Option<&[String]>,
    ) -> impl Iterator<Item = AuditLocation> + use<> {
        let root = self.config().devices.clone();
        let mount_check = self.config().mount_check;
        let mut devices = listdir_sorted(&root);
        if let Some(wanted) = device_dirs {
            devices.retain(|d| wanted.contains(d));
        }
        devices.shuffle(&mut rand::thread_rng());
        let manager = self.clone();

        devices
            .into_iter()
            .filter_map(move |device| {
                let device_path = root.join(&device);
                if mount_check && !is_mount(&device_path) {
                    warn!("Skipping {} as it is not mounted", device_path.display());
                    return None;
                }
                Some((device, device_path))
            })
            .flat_map(move |(device, device_path)| {
                let pool = match manager.pool(&device) {
                    Ok(pool) => pool,
                    Err(e) => {
                        warn!("Skipping {}: {}", device_path.display(), e);
                        return Vec::new();
                    }
                };
                let job_manager = manager.clone();
                let listed = device_path.clone();
                let partitions = pool
                    .run(move || Ok(list_partitions(&job_manager, &listed)))
                    .unwrap_or_else(|e| {
                        warn!("Failed to list {}: {}", device_path.display(), e);
                        Vec::new()
                    });
                partitions
                    .into_iter()
                    .map(|(partition_path, partition, policy)| {
                        (
                            device.clone(),
                            Arc::clone(&pool),
                            partition_path,
                            partition,
                            policy,
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .flat_map(|(device, pool, partition_path, partition, policy)| {
                let listed = partition_path.clone();
                let hash_dirs = pool
                    .run(move || Ok(list_hash_dirs(&listed)))
                    .unwrap_or_else(|e| {
                        warn!("Failed to list {}: {}", partition_path.display(), e);
                        Vec::new()
                    });
                hash_dirs.into_iter().map(move |path| AuditLocation {
                    path,
                    device: device.clone(),
                    partition: partition.clone(),
                    policy: Arc::clone(&policy),
                })
            })
    }
}

fn list_suffixes(partition_path: &Path) -> Vec<String> {
    listdir_sorted(partition_path)
        .into_iter()
        .filter(|name| is_suffix(name))
        .collect()
}

/// Partitions of every known policy on a device
fn list_partitions(
    manager: &DiskFileManager,
    device_path: &Path,
) -> Vec<(PathBuf, String, Arc<StoragePolicy>)> {
    listdir_sorted(device_path)
        .into_iter()
        .filter_map(|dir| {
            let policy = manager.policies().get_by_data_dir(&dir)?;
            Some((device_path.join(dir), policy))
        })
        .flat_map(|(data_path, policy)| {
            listdir_sorted(&data_path)
                .into_iter()
                .map(move |partition| {
                    (data_path.join(&partition), partition, Arc::clone(&policy))
                })
        })
        .collect()
}

/// Hash directories below every suffix of a partition
fn list_hash_dirs(partition_path: &Path) -> Vec<PathBuf> {
    list_suffixes(partition_path)
        .into_iter()
        .flat_map(|suffix| {
            let suffix_path = partition_path.join(suffix);
            listdir_sorted(&suffix_path)
                .into_iter()
                .filter(|hash| {
                    let valid = is_valid_hash(hash);
                    if !valid {
                        debug!("Skipping {:?} in {}", hash, suffix_path.display());
                    }
                    valid
                })
                .map(|hash| suffix_path.join(hash))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn hash_entries(suffix_path: &Path, layout: &'static dyn FilesetLayout) -> Vec<HashEntry> {
    listdir_sorted(suffix_path)
        .into_iter()
        .filter(|hash| is_valid_hash(hash))
        .filter_map(|hash| {
            let path = suffix_path.join(&hash);
            let files = listdir_sorted(&path);
            let fileset = match fileset::resolve(layout, &files, None) {
                Ok(fileset) => fileset,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    return None;
                }
            };
            let ts_data = fileset
                .data_file
                .as_ref()
                .or(fileset.ts_file.as_ref())?
                .timestamp;
            let ts_meta = fileset.meta_file.map(|m| m.timestamp);
            Some(HashEntry {
                path,
                hash,
                ts_data,
                ts_meta,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{DEVICE, policy0, test_manager};
    use std::collections::HashSet;
    use std::fs;

    fn touch(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for name in names {
            fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn test_yield_suffixes() {
        let (root, manager) = test_manager(|_| {});
        let part = root.path().join(DEVICE).join("objects/9");
        fs::create_dir_all(part.join("abc")).unwrap();
        fs::create_dir_all(part.join("0f1")).unwrap();
        fs::write(part.join("hashes.json"), b"{}").unwrap();

        let suffixes: Vec<String> = manager
            .yield_suffixes(DEVICE, "9", &policy0(&manager))
            .unwrap()
            .map(|(_, s)| s)
            .collect();
        assert_eq!(suffixes, vec!["0f1", "abc"]);
        assert_eq!(
            manager
                .yield_suffixes(DEVICE, "10", &policy0(&manager))
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn test_yield_hashes() {
        let (root, manager) = test_manager(|_| {});
        let part = root.path().join(DEVICE).join("objects/9");
        touch(&part.join("abc/1111abc"), &["1000.data", "1002.meta"]);
        touch(&part.join("abc/2222abc"), &["1500.ts"]);
        touch(&part.join("def/3333def"), &["1001.meta"]);
        touch(&part.join("def/4444def"), &["2000.data"]);

        let entries: Vec<HashEntry> = manager
            .yield_hashes(DEVICE, "9", &policy0(&manager), None)
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].hash, "1111abc");
        assert_eq!(entries[0].ts_data, "1000".parse().unwrap());
        assert_eq!(entries[0].ts_meta, Some("1002".parse().unwrap()));
        assert_eq!(entries[1].hash, "2222abc");
        assert_eq!(entries[1].ts_meta, None);
        assert_eq!(entries[2].path, part.join("def/4444def"));

        let only_def: Vec<String> = manager
            .yield_hashes(DEVICE, "9", &policy0(&manager), Some(vec!["def".into()]))
            .unwrap()
            .map(|e| e.hash)
            .collect();
        assert_eq!(only_def, vec!["4444def"]);
    }

    #[test]
    fn test_yield_hashes_ignores_names_outside_partition() {
        let (root, manager) = test_manager(|_| {});
        let device = root.path().join(DEVICE);
        touch(&device.join("objects/9/abc/1111abc"), &["1000.data"]);
        touch(&device.join("abc"), &["1000.data"]);

        let escaped: Vec<HashEntry> = manager
            .yield_hashes(DEVICE, "9", &policy0(&manager), Some(vec!["../..".into()]))
            .unwrap()
            .collect();
        assert!(escaped.is_empty());

        let mixed: Vec<String> = manager
            .yield_hashes(
                DEVICE,
                "9",
                &policy0(&manager),
                Some(vec!["..".into(), "abc".into()]),
            )
            .unwrap()
            .map(|e| e.hash)
            .collect();
        assert_eq!(mixed, vec!["1111abc"]);
    }

    #[test]
    fn test_listings_on_io_threads() {
        let (root, manager) = test_manager(|c| c.threads_per_disk = 1);
        let part = root.path().join(DEVICE).join("objects/9");
        touch(&part.join("abc/1111abc"), &["1000.data"]);

        assert_eq!(
            manager
                .yield_suffixes(DEVICE, "9", &policy0(&manager))
                .unwrap()
                .count(),
            1
        );
        assert_eq!(
            manager
                .yield_hashes(DEVICE, "9", &policy0(&manager), None)
                .unwrap()
                .count(),
            1
        );
        assert_eq!(manager.object_audit_location_generator(None).count(), 1);
    }

    #[test]
    fn test_audit_skips_names_that_are_not_hashes() {
        let (root, manager) = test_manager(|_| {});
        let suffix = root.path().join(DEVICE).join("objects/1/abc");
        touch(&suffix.join("1111abc"), &["1.data"]);
        touch(&suffix.join("a\u{e9}\u{e9}"), &["1.data"]);
        touch(&suffix.join("NOTHEX"), &["1.data"]);

        let found: Vec<PathBuf> = manager
            .object_audit_location_generator(None)
            .map(|loc| loc.path)
            .collect();
        assert_eq!(found, vec![suffix.join("1111abc")]);
    }

    #[test]
    fn test_audit_location_generator() {
        let (root, manager) = test_manager(|_| {});
        let sdb = "sdb1";
        touch(&root.path().join(DEVICE).join("objects/1/abc/1111abc"), &["1.data"]);
        touch(&root.path().join(DEVICE).join("objects/2/def/2222def"), &["1.data"]);
        touch(&root.path().join(sdb).join("objects/3/fed/3333fed"), &["1.data"]);
        // Not object data
        touch(&root.path().join(sdb).join("tmp/xyz"), &["junk"]);
        touch(&root.path().join(sdb).join("objects-7/4/aaa/4444aaa"), &["1.data"]);

        let found: HashSet<(String, String, PathBuf)> = manager
            .object_audit_location_generator(None)
            .map(|loc| (loc.device, loc.partition, loc.path))
            .collect();
        assert_eq!(
            found,
            HashSet::from([
                (
                    DEVICE.to_string(),
                    "1".to_string(),
                    root.path().join(DEVICE).join("objects/1/abc/1111abc")
                ),
                (
                    DEVICE.to_string(),
                    "2".to_string(),
                    root.path().join(DEVICE).join("objects/2/def/2222def")
                ),
                (
                    sdb.to_string(),
                    "3".to_string(),
                    root.path().join(sdb).join("objects/3/fed/3333fed")
                ),
            ])
        );

        let only_sdb: Vec<AuditLocation> = manager
            .object_audit_location_generator(Some(&[sdb.to_string()]))
            .collect();
        assert_eq!(only_sdb.len(), 1);
        assert_eq!(only_sdb[0].policy.index(), 0);
    }

    #[test]
    fn test_audit_skips_unmounted_devices() {
        let (root, manager) = test_manager(|c| c.mount_check = true);
        touch(&root.path().join(DEVICE).join("objects/1/abc/1111abc"), &["1.data"]);
        assert_eq!(manager.object_audit_location_generator(None).count(), 0);
    }
}

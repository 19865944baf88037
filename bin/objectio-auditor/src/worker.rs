//! Audit worker
//!
//! One worker walks the audit locations of its devices, opens every object
//! and reads it back in full so the reader's checks run. Corrupt objects
//! end up quarantined by the diskfile layer; the worker only counts them.
//! In zero-byte mode only empty objects are read, which makes the pass
//! cheap enough to run often.

use crate::auditor::Shutdown;
use crate::ratelimit::TokenBucket;
use objectio_common::{AuditorConfig, Error, Result};
use objectio_diskfile::{AuditLocation, DiskFileManager, Lookup};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Kind of audit pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditType {
    /// Read every object
    All,
    /// Read only zero-byte objects
    ZeroByteFile,
}

impl AuditType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::ZeroByteFile => "ZBF",
        }
    }
}

impl fmt::Display for AuditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one reporting interval or a whole pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditStats {
    /// Objects audited without finding a problem
    pub passes: u64,
    pub quarantines: u64,
    /// Locations that failed for reasons other than corruption
    pub errors: u64,
    pub files_processed: u64,
    pub bytes_processed: u64,
}

impl AuditStats {
    fn absorb(&mut self, other: &Self) {
        self.passes += other.passes;
        self.quarantines += other.quarantines;
        self.errors += other.errors;
        self.files_processed += other.files_processed;
        self.bytes_processed += other.bytes_processed;
    }
}

/// Result of one audit pass
#[derive(Clone, Debug)]
pub struct AuditReport {
    pub audit_type: AuditType,
    pub totals: AuditStats,
    pub elapsed: Duration,
    /// Object count per size bucket, keyed by the bucket's upper bound or
    /// `OVER`
    pub size_stats: BTreeMap<String, u64>,
}

/// Walks and verifies the objects of a set of devices
pub struct AuditorWorker {
    manager: DiskFileManager,
    audit_type: AuditType,
    device_dirs: Option<Vec<String>>,
    files_limiter: TokenBucket,
    bytes_limiter: Arc<TokenBucket>,
    log_time: Duration,
    size_buckets: Vec<u64>,
    size_stats: BTreeMap<String, u64>,
    stats: AuditStats,
    totals: AuditStats,
    shutdown: Arc<Shutdown>,
}

impl AuditorWorker {
    #[must_use]
    pub fn new(
        manager: DiskFileManager,
        config: &AuditorConfig,
        audit_type: AuditType,
        device_dirs: Option<Vec<String>>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let files_per_second = match audit_type {
            AuditType::All => config.files_per_second,
            AuditType::ZeroByteFile => config.zero_byte_files_per_second,
        };
        let mut size_buckets = config.object_size_stats.clone();
        size_buckets.sort_unstable();
        size_buckets.dedup();

        Self {
            manager,
            audit_type,
            device_dirs,
            files_limiter: TokenBucket::per_second(files_per_second),
            bytes_limiter: Arc::new(TokenBucket::per_second(config.bytes_per_second)),
            log_time: Duration::from_secs(config.log_time.max(1)),
            size_buckets,
            size_stats: BTreeMap::new(),
            stats: AuditStats::default(),
            totals: AuditStats::default(),
            shutdown,
        }
    }

    #[must_use]
    pub const fn audit_type(&self) -> AuditType {
        self.audit_type
    }

    /// Audit every location once
    pub fn audit_all_objects(&mut self, mode: &str) -> AuditReport {
        let scope = self
            .device_dirs
            .as_ref()
            .map_or_else(String::new, |d| format!(" - parallel, {}", d.join(", ")));
        info!(
            "Begin object audit \"{}\" mode ({}{})",
            mode, self.audit_type, scope
        );

        self.stats = AuditStats::default();
        self.totals = AuditStats::default();
        self.size_stats.clear();
        let begin = Instant::now();
        let mut reported = begin;

        let locations = self
            .manager
            .object_audit_location_generator(self.device_dirs.as_deref());
        for location in locations {
            if self.shutdown.is_triggered() {
                info!("Object audit ({}) interrupted", self.audit_type);
                break;
            }
            self.files_limiter.acquire(1);
            self.failsafe_object_audit(&location);
            self.stats.files_processed += 1;

            if reported.elapsed() >= self.log_time {
                self.log_progress(begin, reported.elapsed());
                self.totals.absorb(&self.stats);
                self.stats = AuditStats::default();
                reported = Instant::now();
            }
        }
        self.totals.absorb(&self.stats);
        self.stats = AuditStats::default();

        let elapsed = begin.elapsed();
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        #[allow(clippy::cast_precision_loss)]
        let (files_rate, bytes_rate) = (
            self.totals.files_processed as f64 / secs,
            self.totals.bytes_processed as f64 / secs,
        );
        info!(
            "Object audit ({}) \"{}\" mode completed: {:.02}s. Total quarantined: {}, \
             Total errors: {}, Total files/sec: {:.02}, Total bytes/sec: {:.02}",
            self.audit_type,
            mode,
            secs,
            self.totals.quarantines,
            self.totals.errors,
            files_rate,
            bytes_rate
        );
        if !self.size_stats.is_empty() {
            info!("Object audit stats: {:?}", self.size_stats);
        }

        AuditReport {
            audit_type: self.audit_type,
            totals: self.totals,
            elapsed,
            size_stats: self.size_stats.clone(),
        }
    }

    fn log_progress(&self, begin: Instant, interval: Duration) {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        #[allow(clippy::cast_precision_loss)]
        let (files_rate, bytes_rate) = (
            self.stats.files_processed as f64 / secs,
            self.stats.bytes_processed as f64 / secs,
        );
        info!(
            "Object audit ({}). Since {:.0}s ago: Locally: {} passed, {} quarantined, \
             {} errors, files/sec: {:.02}, bytes/sec: {:.02}",
            self.audit_type,
            begin.elapsed().as_secs_f64(),
            self.stats.passes,
            self.stats.quarantines,
            self.stats.errors,
            files_rate,
            bytes_rate
        );
    }

    /// Audit one location; no error or panic escapes
    pub fn failsafe_object_audit(&mut self, location: &AuditLocation) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.object_audit(location))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.errors += 1;
                error!("Error trying to audit {}: {}", location, e);
            }
            Err(_) => {
                self.stats.errors += 1;
                error!("Panic trying to audit {}", location);
            }
        }
    }

    /// Open and read back one object
    pub fn object_audit(&mut self, location: &AuditLocation) -> Result<()> {
        let diskfile = self.manager.get_diskfile_from_audit_location(location)?;
        let open = match diskfile.lookup()? {
            Lookup::Found(open) => open,
            Lookup::Absent | Lookup::Deleted(_) | Lookup::Expired(_) => {
                debug!("Nothing to audit at {}", location);
                return Ok(());
            }
            Lookup::Corrupt(reason) => {
                self.record_quarantine(location, &reason);
                return Ok(());
            }
        };

        let size = open.content_length();
        self.record_size(size);
        if self.audit_type == AuditType::ZeroByteFile && size > 0 {
            self.stats.passes += 1;
            return Ok(());
        }

        let limiter = Arc::clone(&self.bytes_limiter);
        let reader = open.reader(false).with_read_hook(move |n: usize| {
            limiter.acquire(n as u64);
        });
        for chunk in reader {
            match chunk {
                Ok(chunk) => self.stats.bytes_processed += chunk.len() as u64,
                Err(Error::Quarantined { reason }) => {
                    self.record_quarantine(location, &reason);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        self.stats.passes += 1;
        Ok(())
    }

    fn record_quarantine(&mut self, location: &AuditLocation, reason: &str) {
        self.stats.quarantines += 1;
        error!(
            "Object {} failed audit and was quarantined: {}",
            location.path.display(),
            reason
        );
    }

    fn record_size(&mut self, size: u64) {
        if self.size_buckets.is_empty() {
            return;
        }
        let key = self
            .size_buckets
            .iter()
            .find(|&&limit| size <= limit)
            .map_or_else(|| "OVER".to_string(), u64::to_string);
        *self.size_stats.entry(key).or_default() += 1;
    }
}

impl fmt::Debug for AuditorWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditorWorker")
            .field("audit_type", &self.audit_type)
            .field("device_dirs", &self.device_dirs)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use objectio_common::{DiskFileConfig, HashPathConfig, Metadata, ObjectName};
    use objectio_diskfile::StoragePolicyCollection;
    use std::fs::{self, OpenOptions};
    use std::os::unix::fs::FileExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    pub(crate) fn manager(devices: &[&str]) -> (TempDir, DiskFileManager) {
        let root = tempfile::tempdir().unwrap();
        for device in devices {
            fs::create_dir_all(root.path().join(device)).unwrap();
        }
        let manager = DiskFileManager::new(
            DiskFileConfig {
                devices: root.path().to_path_buf(),
                mount_check: false,
                ..DiskFileConfig::default()
            },
            HashPathConfig::default(),
            StoragePolicyCollection::default(),
        );
        (root, manager)
    }

    pub(crate) fn unlimited() -> AuditorConfig {
        AuditorConfig {
            files_per_second: 0.0,
            bytes_per_second: 0.0,
            zero_byte_files_per_second: 0.0,
            ..AuditorConfig::default()
        }
    }

    pub(crate) fn store(manager: &DiskFileManager, device: &str, object: &str, body: &[u8]) -> PathBuf {
        let policy = manager.policies().get_by_index(0).unwrap();
        let name = ObjectName::new("a", "c", object);
        let mut writer = manager
            .get_diskfile(device, "0", &name, &policy)
            .unwrap()
            .create(Some(body.len() as u64))
            .unwrap();
        writer.write(body).unwrap();
        writer
            .put(Metadata::from([("X-Timestamp".to_string(), "1000".to_string())]))
            .unwrap()
    }

    fn corrupt(path: &Path) {
        OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .write_all_at(b"!", 0)
            .unwrap();
    }

    fn worker(manager: &DiskFileManager, config: &AuditorConfig, audit_type: AuditType) -> AuditorWorker {
        AuditorWorker::new(
            manager.clone(),
            config,
            audit_type,
            None,
            Arc::new(Shutdown::default()),
        )
    }

    #[test]
    fn test_full_pass_counts_and_quarantines() {
        let (root, manager) = manager(&["sda"]);
        store(&manager, "sda", "good", b"all fine");
        store(&manager, "sda", "empty", b"");
        let bad = store(&manager, "sda", "bad", b"will rot");
        corrupt(&bad);

        let report = worker(&manager, &unlimited(), AuditType::All).audit_all_objects("once");
        assert_eq!(report.audit_type, AuditType::All);
        assert_eq!(report.totals.files_processed, 3);
        assert_eq!(report.totals.passes, 2);
        assert_eq!(report.totals.quarantines, 1);
        assert_eq!(report.totals.errors, 0);
        assert_eq!(report.totals.bytes_processed, 16);
        assert!(!bad.exists());
        assert_eq!(fs::read_dir(root.path().join("sda/quarantined/objects")).unwrap().count(), 1);
    }

    #[test]
    fn test_zero_byte_pass_skips_nonempty_objects() {
        let (_root, manager) = manager(&["sda"]);
        let big = store(&manager, "sda", "big", b"not read in this mode");
        corrupt(&big);
        store(&manager, "sda", "empty", b"");

        let report = worker(&manager, &unlimited(), AuditType::ZeroByteFile).audit_all_objects("once");
        assert_eq!(report.totals.passes, 2);
        assert_eq!(report.totals.quarantines, 0);
        assert_eq!(report.totals.bytes_processed, 0);
        assert!(big.exists());
    }

    #[test]
    fn test_size_stats_buckets() {
        let (_root, manager) = manager(&["sda"]);
        store(&manager, "sda", "small", &[b'x'; 5]);
        store(&manager, "sda", "medium", &[b'x'; 50]);
        store(&manager, "sda", "large", &[b'x'; 500]);
        let config = AuditorConfig {
            object_size_stats: vec![100, 10],
            ..unlimited()
        };

        let report = worker(&manager, &config, AuditType::All).audit_all_objects("once");
        assert_eq!(
            report.size_stats,
            BTreeMap::from([
                ("10".to_string(), 1),
                ("100".to_string(), 1),
                ("OVER".to_string(), 1),
            ])
        );
    }

    #[test]
    fn test_failsafe_counts_errors() {
        let (root, manager) = manager(&["sda"]);
        let mut worker = worker(&manager, &unlimited(), AuditType::All);
        let location = AuditLocation {
            path: root.path().join("sdz/objects/0/abc/ffffabc"),
            device: "sdz".to_string(),
            partition: "0".to_string(),
            policy: manager.policies().get_by_index(0).unwrap(),
        };
        worker.failsafe_object_audit(&location);
        assert_eq!(worker.stats.errors, 1);
    }

    #[test]
    fn test_pass_survives_non_hash_names() {
        let (root, manager) = manager(&["sda"]);
        store(&manager, "sda", "good", b"all fine");
        let odd = root.path().join("sda/objects/0/abc/a\u{e9}\u{e9}");
        fs::create_dir_all(&odd).unwrap();
        fs::write(odd.join("1000.data"), b"").unwrap();

        let report = worker(&manager, &unlimited(), AuditType::All).audit_all_objects("once");
        assert_eq!(report.totals.files_processed, 1);
        assert_eq!(report.totals.passes, 1);
        assert_eq!(report.totals.errors, 0);

        // Handed over directly it is an error, not a crash
        let mut worker = worker(&manager, &unlimited(), AuditType::All);
        worker.failsafe_object_audit(&AuditLocation {
            path: odd,
            device: "sda".to_string(),
            partition: "0".to_string(),
            policy: manager.policies().get_by_index(0).unwrap(),
        });
        assert_eq!(worker.stats.errors, 1);
    }

    #[test]
    fn test_audits_hash_dir_where_it_was_found() {
        let (root, manager) = manager(&["sda"]);
        let bad = store(&manager, "sda", "misplaced", b"will rot");
        corrupt(&bad);
        let datadir = bad.parent().unwrap();
        let hash = datadir.file_name().unwrap().to_str().unwrap().to_string();
        let suffix = if hash.ends_with("fff") { "000" } else { "fff" };
        let moved = root.path().join("sda/objects/0").join(suffix).join(&hash);
        fs::create_dir_all(moved.parent().unwrap()).unwrap();
        fs::rename(datadir, &moved).unwrap();

        let report = worker(&manager, &unlimited(), AuditType::All).audit_all_objects("once");
        assert_eq!(report.totals.files_processed, 1);
        assert_eq!(report.totals.quarantines, 1);
        assert_eq!(report.totals.errors, 0);
        assert!(!moved.exists());
        assert!(
            root.path()
                .join("sda/quarantined/objects")
                .join(&hash)
                .is_dir()
        );
    }

    #[test]
    fn test_shutdown_stops_pass() {
        let (_root, manager) = manager(&["sda"]);
        store(&manager, "sda", "o", b"x");
        let shutdown = Arc::new(Shutdown::default());
        shutdown.trigger();
        let mut worker = AuditorWorker::new(manager, &unlimited(), AuditType::All, None, shutdown);
        assert_eq!(worker.audit_all_objects("forever").totals.files_processed, 0);
    }
}

//! Configuration types for ObjectIO
//!
//! This module defines configuration structures shared by the diskfile
//! layer and the daemons that drive it. Every section can be omitted from
//! a config file; missing fields take their defaults.

use crate::types::HashPathConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for an object node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Diskfile layer configuration
    pub diskfile: DiskFileConfig,
    /// Object path hashing salts
    pub hash_path: HashPathConfig,
    /// Storage policies; empty means a single implicit `Policy-0`
    pub policies: Vec<PolicyConfig>,
    /// Object auditor configuration
    pub auditor: AuditorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Diskfile layer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskFileConfig {
    /// Root directory holding one subdirectory per device
    pub devices: PathBuf,
    /// Require each device directory to be a mount point
    pub mount_check: bool,
    /// Read chunk size in bytes
    pub disk_chunk_size: usize,
    /// Objects smaller than this may stay in the page cache after a read
    pub keep_cache_size: u64,
    /// Sync written data every this many megabytes
    pub mb_per_sync: u64,
    /// Seconds a tombstone or reclaimable file is kept before removal
    pub reclaim_age: u64,
    /// Allow only one replication job per device at a time
    pub replication_one_per_device: bool,
    /// Seconds to wait for the per-device replication lock
    pub replication_lock_timeout: u64,
    /// Worker threads per device (0 runs I/O on the calling thread)
    pub threads_per_disk: usize,
    /// Use zero-copy `sendfile` when serving reads
    pub splice: bool,
    /// Bytes of free space that preallocation must leave untouched
    pub fallocate_reserve: u64,
}

impl Default for DiskFileConfig {
    fn default() -> Self {
        Self {
            devices: PathBuf::from("/srv/node"),
            mount_check: true,
            disk_chunk_size: 65536,
            keep_cache_size: 5 * 1024 * 1024, // 5 MB
            mb_per_sync: 512,
            reclaim_age: 7 * 24 * 3600, // one week
            replication_one_per_device: true,
            replication_lock_timeout: 15,
            threads_per_disk: 0,
            splice: false,
            fallocate_reserve: 0,
        }
    }
}

impl DiskFileConfig {
    /// Bytes written between syncs
    #[must_use]
    pub const fn bytes_per_sync(&self) -> u64 {
        self.mb_per_sync * 1024 * 1024
    }

    /// Reclaim age as a duration
    #[must_use]
    pub const fn reclaim_age(&self) -> Duration {
        Duration::from_secs(self.reclaim_age)
    }

    /// Replication lock timeout as a duration
    #[must_use]
    pub const fn replication_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_lock_timeout)
    }
}

/// On-disk layout kind of a storage policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    /// Whole-object replicas, `<ts>.data`
    #[default]
    Replication,
    /// Erasure-coded fragments, `<ts>#<frag>.data` plus `<ts>.durable`
    ErasureCoding,
}

/// Configuration for a single storage policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Policy index; 0 uses the unsuffixed directories
    pub index: u32,
    /// Primary name
    pub name: String,
    /// Additional names the policy answers to
    pub aliases: Vec<String>,
    /// Layout kind
    pub policy_type: PolicyType,
    /// Marks the default policy
    pub default: bool,
    /// Deprecated policies keep serving existing data but cannot be default
    pub deprecated: bool,
    /// Data fragments per object (erasure coding only)
    pub ec_num_data_fragments: u32,
    /// Parity fragments per object (erasure coding only)
    pub ec_num_parity_fragments: u32,
}

/// Object auditor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditorConfig {
    /// Objects audited per second
    pub files_per_second: f64,
    /// Bytes read per second
    pub bytes_per_second: f64,
    /// Objects checked per second by the zero-byte-file pass (0 disables it)
    pub zero_byte_files_per_second: f64,
    /// Seconds between progress reports
    pub log_time: u64,
    /// Seconds between passes when running continuously
    pub interval: u64,
    /// Number of parallel workers, each owning a slice of the devices
    pub concurrency: usize,
    /// Upper bounds (bytes) of object size histogram buckets
    pub object_size_stats: Vec<u64>,
    /// Restrict auditing to these device names
    pub device_dirs: Vec<String>,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            files_per_second: 20.0,
            bytes_per_second: 10_000_000.0,
            zero_byte_files_per_second: 50.0,
            log_time: 3600,
            interval: 30,
            concurrency: 1,
            object_size_stats: Vec::new(),
            device_dirs: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

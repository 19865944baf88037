//! ObjectIO Diskfile - on-disk object storage
//!
//! This crate stores objects as files on locally mounted devices:
//! - Fileset resolution of each object's hash directory
//! - Atomic writes through a per-device temp area
//! - Verified, chunked reads with quarantine of corrupt objects
//! - Per-partition suffix hash cache for replication
//! - Tree walks for replication and auditing
//!
//! Layout of one device:
//!
//! ```text
//! <device>/objects[-N]/<partition>/<suffix>/<hash>/<timestamp>.{data,meta,ts}
//! <device>/tmp[-N]/
//! <device>/async_pending[-N]/<suffix>/<hash>-<timestamp>
//! <device>/quarantined/objects[-N]/<hash>
//! ```

pub mod diskfile;
pub mod fileset;
pub mod hashes;
pub mod location;
pub mod lock;
pub mod manager;
pub mod metadata;
pub mod policy;
pub mod quarantine;
pub mod raw_io;
pub mod reader;
pub mod threadpool;
pub mod writer;

// Re-exports
pub use diskfile::{DiskFile, Lookup, OpenDiskFile};
pub use fileset::{
    ErasureCodedLayout, FileKind, Fileset, FilesetLayout, OnDiskFile, ReclaimCategory,
    ReplicatedLayout, resolve,
};
pub use hashes::{HASH_FILE, SuffixHashes};
pub use location::{AuditLocation, HashEntry};
pub use manager::{AsyncUpdate, DiskFileManager, DiskFileStats, ReplicationLock, is_mount};
pub use policy::{StoragePolicy, StoragePolicyCollection};
pub use reader::{DiskFileReader, QuarantineHook, ReadHook};
pub use writer::DiskFileWriter;

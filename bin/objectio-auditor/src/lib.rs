//! ObjectIO object auditor
//!
//! Walks every object on a node, reads it back and verifies it against its
//! metadata, quarantining whatever fails.

pub mod auditor;
pub mod ratelimit;
pub mod worker;

pub use auditor::{ObjectAuditor, Shutdown};
pub use ratelimit::TokenBucket;
pub use worker::{AuditReport, AuditStats, AuditType, AuditorWorker};

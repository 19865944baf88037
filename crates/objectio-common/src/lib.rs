//! ObjectIO Common - Shared types and utilities
//!
//! This crate provides the error type, timestamps, object identities and
//! configuration used by the diskfile layer and the daemons built on it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AuditorConfig, Config, DiskFileConfig, LoggingConfig, PolicyConfig, PolicyType};
pub use error::{Error, Result};
pub use types::*;

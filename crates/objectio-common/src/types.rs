//! Core type definitions for ObjectIO
//!
//! This module defines the fundamental types shared by the diskfile layer
//! and its clients: timestamps that name on-disk files, object identities,
//! and the salted path hash that maps an identity to its hash directory.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Object metadata as stored alongside `.data` and `.meta` files
pub type Metadata = BTreeMap<String, String>;

/// Ticks per second (timestamps carry five decimal places)
const TICKS_PER_SECOND: u64 = 100_000;

/// Width of the normalized timestamp form (`0000001000.00000`)
pub const NORMAL_TIMESTAMP_LEN: usize = 16;

/// Point in time used to name and order on-disk files.
///
/// Ordered by time first, then by offset. The offset lets several
/// generations share one wall-clock time while still sorting
/// deterministically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    ticks: u64,
    offset: u64,
}

impl Timestamp {
    /// Create a timestamp from fractional seconds since the epoch
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_secs(secs: f64) -> Self {
        let ticks = (secs.max(0.0) * TICKS_PER_SECOND as f64).round() as u64;
        Self { ticks, offset: 0 }
    }

    /// Current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_secs(elapsed.as_secs_f64())
    }

    /// Same time with the given offset
    #[must_use]
    pub const fn with_offset(self, offset: u64) -> Self {
        Self {
            ticks: self.ticks,
            offset,
        }
    }

    /// Offset component
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Seconds since the epoch
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(&self) -> f64 {
        self.ticks as f64 / TICKS_PER_SECOND as f64
    }

    /// Whole seconds since the epoch
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.ticks / TICKS_PER_SECOND
    }

    /// Age of this timestamp relative to `now`, zero if in the future
    #[must_use]
    pub fn age(&self, now: Timestamp) -> Duration {
        let ticks = now.ticks.saturating_sub(self.ticks);
        Duration::from_micros(ticks * (1_000_000 / TICKS_PER_SECOND))
    }

    /// Fixed-width form without the offset, e.g. `0000001000.00000`
    #[must_use]
    pub fn normal(&self) -> String {
        format!(
            "{:010}.{:05}",
            self.ticks / TICKS_PER_SECOND,
            self.ticks % TICKS_PER_SECOND
        )
    }

    /// Form used in filenames; appends `_<16 hex>` when an offset is set
    #[must_use]
    pub fn internal(&self) -> String {
        if self.offset > 0 {
            format!("{}_{:016x}", self.normal(), self.offset)
        } else {
            self.normal()
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.internal())
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidTimestamp(s.to_string());

        let (time, offset) = match s.split_once('_') {
            Some((time, offset)) => {
                let offset = u64::from_str_radix(offset, 16).map_err(|_| invalid())?;
                (time, offset)
            }
            None => (s, 0),
        };

        let (whole, frac) = time.split_once('.').unwrap_or((time, ""));
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let secs: u64 = whole.parse().map_err(|_| invalid())?;

        // Five decimal places, rounding on the sixth
        let mut digits: Vec<u8> = frac.bytes().map(|b| b - b'0').collect();
        let round_up = digits.get(5).is_some_and(|d| *d >= 5);
        digits.resize(5, 0);
        let mut fraction = digits.iter().fold(0u64, |acc, d| acc * 10 + u64::from(*d));
        if round_up {
            fraction += 1;
        }

        let ticks = secs
            .checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(fraction))
            .ok_or_else(invalid)?;

        Ok(Self { ticks, offset })
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.internal())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logical identity of an object: account, container and object name
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectName {
    pub account: String,
    pub container: String,
    pub object: String,
}

impl ObjectName {
    /// Create a new object identity
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            object: object.into(),
        }
    }

    /// Path form stored in the `name` metadata key, `/a/c/o`
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{}/{}/{}", self.account, self.container, self.object)
    }

    /// Parse a stored `/a/c/o` name; the object part may contain slashes
    pub fn parse(name: &str) -> Result<Self> {
        let rest = name
            .strip_prefix('/')
            .ok_or_else(|| Error::invalid_argument(format!("object name not absolute: {name}")))?;
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(c), Some(o)) if !a.is_empty() && !c.is_empty() && !o.is_empty() => {
                Ok(Self::new(a, c, o))
            }
            _ => Err(Error::invalid_argument(format!(
                "object name must be /account/container/object: {name}"
            ))),
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Salts mixed into every object path hash.
///
/// All nodes of a cluster must agree on these values, otherwise the same
/// object lands in different hash directories.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPathConfig {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

impl HashPathConfig {
    /// MD5 hex digest naming the hash directory of `name`
    #[must_use]
    pub fn hash_path(&self, name: &ObjectName) -> String {
        self.hash_raw(&name.path())
    }

    /// Hash an already formatted `/a/c/o` path
    #[must_use]
    pub fn hash_raw(&self, path: &str) -> String {
        let mut ctx = md5::Context::new();
        ctx.consume(self.prefix.as_bytes());
        ctx.consume(path.as_bytes());
        ctx.consume(self.suffix.as_bytes());
        format!("{:x}", ctx.compute())
    }
}

/// Suffix directory name for a hash: its last three characters
#[must_use]
pub fn hash_suffix(hash: &str) -> &str {
    let start = hash.char_indices().rev().nth(2).map_or(0, |(i, _)| i);
    &hash[start..]
}

/// Whether `name` can be a hash directory: non-empty lowercase hex
#[must_use]
pub fn is_valid_hash(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Hash directory of an object under a policy data directory
#[must_use]
pub fn storage_directory(datadir: &Path, partition: &str, hash: &str) -> PathBuf {
    datadir.join(partition).join(hash_suffix(hash)).join(hash)
}

//! Quarantine area
//!
//! Corrupt units are renamed to `<device>/quarantined/<data dir>/<name>`.
//! A name already taken in the quarantine area gets a random suffix, so
//! repeated quarantines of the same hash never overwrite evidence.

use objectio_common::{Error, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Top-level quarantine directory under each device
pub const QUARANTINE_DIR: &str = "quarantined";

/// Move `unit` (a hash directory, or a file squatting on one) into the
/// device's quarantine area and return its new path.
pub fn quarantine_renamer(device_path: &Path, unit: &Path, data_dir: &str) -> Result<PathBuf> {
    let name = unit
        .file_name()
        .ok_or_else(|| Error::invalid_argument(format!("cannot quarantine {}", unit.display())))?;
    let area = device_path.join(QUARANTINE_DIR).join(data_dir);
    std::fs::create_dir_all(&area)?;

    let mut target = area.join(name);
    if target.exists() {
        target = area.join(format!(
            "{}-{}",
            name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));
    }

    match std::fs::rename(unit, &target) {
        Ok(()) => Ok(target),
        // Target created between the check and the rename
        Err(e) if matches!(e.raw_os_error(), Some(libc::ENOTEMPTY | libc::EEXIST)) => {
            let target = area.join(format!(
                "{}-{}",
                name.to_string_lossy(),
                Uuid::new_v4().simple()
            ));
            std::fs::rename(unit, &target)?;
            Ok(target)
        }
        Err(e) => Err(Error::DiskIo(e)),
    }
}

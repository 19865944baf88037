//! Platform-specific file primitives
//!
//! Thin wrappers over libc calls the standard library does not expose:
//! - Preallocation (`posix_fallocate` on Linux)
//! - Page cache eviction (`posix_fadvise(DONTNEED)` on Linux)
//! - Free space queries (`statvfs`)
//! - Extended attributes (`fgetxattr`/`fsetxattr`, Linux and macOS signatures)
//! - Zero-copy transfer (`sendfile` on Linux)
//!
//! Everything returns `std::io::Result` so callers can classify errno values.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

fn c_string(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Reserve `size` bytes of disk space for `file`
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
pub fn fallocate(file: &File, size: u64) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    // posix_fallocate returns the error number instead of setting errno
    let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

/// Reserve `size` bytes of disk space for `file` (no-op on this platform)
#[cfg(not(target_os = "linux"))]
pub fn fallocate(_file: &File, _size: u64) -> io::Result<()> {
    Ok(())
}

/// Ask the kernel to evict a byte range of `file` from the page cache
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
pub fn drop_buffer_cache(file: &File, offset: u64, length: u64) {
    let ret = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            length as libc::off_t,
            libc::POSIX_FADV_DONTNEED,
        )
    };
    if ret != 0 {
        tracing::debug!(
            "posix_fadvise({}, {}) failed: {}",
            offset,
            length,
            io::Error::from_raw_os_error(ret)
        );
    }
}

/// Page cache eviction is advisory; nothing to do on this platform
#[cfg(not(target_os = "linux"))]
pub fn drop_buffer_cache(_file: &File, _offset: u64, _length: u64) {}

/// Bytes available to unprivileged users on the filesystem holding `path`
#[allow(clippy::useless_conversion, clippy::unnecessary_cast)]
pub fn free_space(path: &Path) -> io::Result<u64> {
    let c_path = c_string(path.as_os_str().as_bytes())?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u64::from(stat.f_bavail) * stat.f_frsize as u64)
}

#[cfg(target_os = "linux")]
unsafe fn raw_fsetxattr(fd: libc::c_int, name: &CString, value: &[u8]) -> libc::c_int {
    unsafe {
        libc::fsetxattr(
            fd,
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    }
}

#[cfg(target_os = "macos")]
unsafe fn raw_fsetxattr(fd: libc::c_int, name: &CString, value: &[u8]) -> libc::c_int {
    unsafe {
        libc::fsetxattr(
            fd,
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
            0,
        )
    }
}

#[cfg(target_os = "linux")]
unsafe fn raw_fgetxattr(fd: libc::c_int, name: &CString, buf: &mut [u8]) -> libc::ssize_t {
    unsafe {
        libc::fgetxattr(
            fd,
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    }
}

#[cfg(target_os = "macos")]
unsafe fn raw_fgetxattr(fd: libc::c_int, name: &CString, buf: &mut [u8]) -> libc::ssize_t {
    unsafe {
        libc::fgetxattr(
            fd,
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            0,
        )
    }
}

#[cfg(target_os = "linux")]
const ENOATTR: i32 = libc::ENODATA;

#[cfg(target_os = "macos")]
const ENOATTR: i32 = libc::ENOATTR;

/// True when `err` reports an unsupported extended attribute namespace
#[must_use]
pub fn is_xattr_unsupported(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOTSUP))
}

/// Set extended attribute `name` on `file`
pub fn set_xattr(file: &File, name: &str, value: &[u8]) -> io::Result<()> {
    let c_name = c_string(name.as_bytes())?;
    let ret = unsafe { raw_fsetxattr(file.as_raw_fd(), &c_name, value) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read extended attribute `name` from `file`; `None` if it is not set
#[allow(clippy::cast_sign_loss)]
pub fn get_xattr(file: &File, name: &str) -> io::Result<Option<Vec<u8>>> {
    let c_name = c_string(name.as_bytes())?;
    let fd = file.as_raw_fd();
    loop {
        let size = unsafe { raw_fgetxattr(fd, &c_name, &mut []) };
        if size < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ENOATTR) {
                return Ok(None);
            }
            return Err(err);
        }

        let mut buf = vec![0u8; size as usize];
        let read = unsafe { raw_fgetxattr(fd, &c_name, &mut buf) };
        if read < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // Attribute grew between the two calls
                Some(libc::ERANGE) => continue,
                Some(code) if code == ENOATTR => return Ok(None),
                _ => return Err(err),
            }
        }
        buf.truncate(read as usize);
        return Ok(Some(buf));
    }
}

/// Copy `count` bytes of `input` starting at `offset` to `out` in the kernel.
///
/// Returns the number of bytes sent. `EINVAL` and `ENOSYS` mean the pair of
/// descriptors cannot be spliced and the caller should copy through userspace.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn sendfile(out: &impl AsRawFd, input: &File, offset: u64, count: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    let ret = unsafe { libc::sendfile(out.as_raw_fd(), input.as_raw_fd(), &mut off, count) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Zero-copy transfer is unavailable on this platform
#[cfg(not(target_os = "linux"))]
pub fn sendfile(_out: &impl AsRawFd, _input: &File, _offset: u64, _count: usize) -> io::Result<usize> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// Whether this platform can splice file data to another descriptor
#[must_use]
pub const fn splice_supported() -> bool {
    cfg!(target_os = "linux")
}

/// Fsync a directory so a rename inside it is durable
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_xattr_set_and_get() {
        let temp = NamedTempFile::new().unwrap();
        let file = temp.as_file();

        match set_xattr(file, "user.objectio.test", b"value") {
            Ok(()) => {}
            // tmpfs without user xattrs
            Err(e) if is_xattr_unsupported(&e) => return,
            Err(e) => panic!("set_xattr failed: {e}"),
        }

        assert_eq!(
            get_xattr(file, "user.objectio.test").unwrap().as_deref(),
            Some(&b"value"[..])
        );
        assert_eq!(get_xattr(file, "user.objectio.missing").unwrap(), None);
    }

    #[test]
    fn test_free_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_fallocate_grows_file() {
        let temp = NamedTempFile::new().unwrap();
        fallocate(temp.as_file(), 8192).unwrap();
        if cfg!(target_os = "linux") {
            assert_eq!(temp.as_file().metadata().unwrap().len(), 8192);
        }
    }
}

//! Streaming object reads
//!
//! A [`DiskFileReader`] yields the object body in `disk_chunk_size` chunks.
//! A read that covers the whole object also checks what it read: the byte
//! count against the recorded size and the MD5 against the `ETag`. A
//! mismatch quarantines the object, and the reader then yields
//! [`Error::Quarantined`] as its last item.

use crate::diskfile::DiskFile;
use crate::metadata::{self, ETAG};
use crate::raw_io;
use bytes::Bytes;
use objectio_common::{Error, Metadata, Result};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const DROP_CACHE_WINDOW: u64 = 1024 * 1024;
const SENDFILE_MAX: u64 = 1 << 30;

/// Observer of bytes leaving the disk
pub trait ReadHook: Send {
    fn bytes_read(&mut self, len: usize);
}

impl<F: FnMut(usize) + Send> ReadHook for F {
    fn bytes_read(&mut self, len: usize) {
        self(len);
    }
}

/// Observer notified when a read quarantines the object
pub trait QuarantineHook: Send {
    fn quarantined(&mut self, reason: &str);
}

impl<F: FnMut(&str) + Send> QuarantineHook for F {
    fn quarantined(&mut self, reason: &str) {
        self(reason);
    }
}

/// Chunked reader over an opened object
pub struct DiskFileReader {
    diskfile: DiskFile,
    file: Arc<File>,
    data_file: PathBuf,
    metadata: Metadata,
    size: u64,
    chunk_size: usize,
    keep_cache: bool,
    offset: u64,
    end: u64,
    last_drop: u64,
    bytes_read: u64,
    /// Present while the read covers the whole object
    md5: Option<md5::Context>,
    read_hook: Option<Box<dyn ReadHook>>,
    quarantine_hook: Option<Box<dyn QuarantineHook>>,
    done: bool,
}

impl DiskFileReader {
    pub(crate) fn new(
        diskfile: DiskFile,
        file: File,
        data_file: PathBuf,
        metadata: Metadata,
        size: u64,
        keep_cache: bool,
    ) -> Self {
        let chunk_size = diskfile.manager.config().disk_chunk_size.max(1);
        Self {
            diskfile,
            file: Arc::new(file),
            data_file,
            metadata,
            size,
            chunk_size,
            keep_cache,
            offset: 0,
            end: size,
            last_drop: 0,
            bytes_read: 0,
            md5: Some(md5::Context::new()),
            read_hook: None,
            quarantine_hook: None,
            done: false,
        }
    }

    /// Call `hook` with the size of every chunk read
    #[must_use]
    pub fn with_read_hook(mut self, hook: impl ReadHook + 'static) -> Self {
        self.read_hook = Some(Box::new(hook));
        self
    }

    /// Call `hook` if this read quarantines the object
    #[must_use]
    pub fn with_quarantine_hook(mut self, hook: impl QuarantineHook + 'static) -> Self {
        self.quarantine_hook = Some(Box::new(hook));
        self
    }

    /// Restrict the read to bytes `start..stop`.
    ///
    /// Partial reads skip verification.
    #[must_use]
    pub fn range(mut self, start: u64, stop: u64) -> Self {
        let stop = stop.min(self.size);
        self.offset = start.min(stop);
        self.last_drop = self.offset;
        self.end = stop;
        if self.offset != 0 || stop != self.size {
            self.md5 = None;
        }
        self
    }

    /// Recorded object size
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// Bytes delivered so far
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Copy the rest of the read into `out`.
    ///
    /// Uses in-kernel `sendfile` when zero-copy is enabled, falling back to
    /// buffered copies if the descriptors do not support it. The in-kernel
    /// path cannot checksum, so it skips verification.
    pub fn send_to<W: Write + AsRawFd>(mut self, out: &mut W) -> Result<u64> {
        if self.diskfile.manager.use_splice() {
            if let Some(sent) = self.try_sendfile(out)? {
                return Ok(sent);
            }
        }
        let mut sent = 0;
        for chunk in &mut self {
            let chunk = chunk?;
            out.write_all(&chunk)?;
            sent += chunk.len() as u64;
        }
        Ok(sent)
    }

    fn try_sendfile<W: AsRawFd>(&mut self, out: &W) -> Result<Option<u64>> {
        let start = self.offset;
        while self.offset < self.end {
            let count = (self.end - self.offset).min(SENDFILE_MAX) as usize;
            match raw_io::sendfile(out, &self.file, self.offset, count) {
                Ok(0) => break,
                Ok(n) => self.advance(n),
                Err(e)
                    if self.offset == start
                        && matches!(e.raw_os_error(), Some(libc::EINVAL | libc::ENOSYS)) =>
                {
                    debug!("sendfile unsupported here ({}); using buffered reads", e);
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.md5 = None;
        self.done = true;
        self.drop_cache(true);
        Ok(Some(self.offset - start))
    }

    fn advance(&mut self, n: usize) {
        self.offset += n as u64;
        self.bytes_read += n as u64;
        if let Some(hook) = &mut self.read_hook {
            hook.bytes_read(n);
        }
        self.drop_cache(false);
    }

    fn drop_cache(&mut self, force: bool) {
        if self.keep_cache {
            return;
        }
        let pending = self.offset.saturating_sub(self.last_drop);
        if pending > 0 && (force || pending >= DROP_CACHE_WINDOW) {
            raw_io::drop_buffer_cache(&self.file, self.last_drop, pending);
            self.last_drop = self.offset;
        }
    }

    fn read_chunk(&self) -> Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        let offset = self.offset;
        let len = (self.end - self.offset).min(self.chunk_size as u64) as usize;
        self.diskfile.pool.run(move || {
            let mut buf = vec![0; len];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(buf)
        })
    }

    /// Verify a complete read; quarantines on mismatch
    fn finish(&mut self) -> Result<()> {
        self.done = true;
        self.drop_cache(true);
        let Some(md5) = self.md5.take() else {
            return Ok(());
        };

        let reason = if self.bytes_read != self.size {
            Some(format!(
                "Bytes read: {}, does not match metadata: {}",
                self.bytes_read, self.size
            ))
        } else {
            let digest = format!("{:x}", md5.compute());
            metadata::get(&self.metadata, ETAG)
                .map(|etag| etag.trim_matches('"'))
                .filter(|etag| !etag.eq_ignore_ascii_case(&digest))
                .map(|etag| format!("ETag {etag} and file's md5 {digest} do not match"))
        };
        let Some(reason) = reason else {
            return Ok(());
        };

        let err = self.diskfile.quarantine(&reason);
        if err.is_quarantined() {
            if let Some(hook) = &mut self.quarantine_hook {
                hook.quarantined(&reason);
            }
        }
        Err(err)
    }

    /// Stop reading; nothing is verified
    pub fn close(mut self) {
        self.md5 = None;
        self.drop_cache(true);
    }
}

impl Iterator for DiskFileReader {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.offset >= self.end {
            return self.finish().err().map(Err);
        }
        match self.read_chunk() {
            Ok(buf) if buf.is_empty() => self.finish().err().map(Err),
            Ok(buf) => {
                if let Some(md5) = &mut self.md5 {
                    md5.consume(&buf);
                }
                self.advance(buf.len());
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for DiskFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFileReader")
            .field("data_file", &self.data_file)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("end", &self.end)
            .field("verifying", &self.md5.is_some())
            .finish_non_exhaustive()
    }
}

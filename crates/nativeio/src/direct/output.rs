use std::{
    fmt,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Instant,
};

use crc32fast::Hasher;
use metrics::{counter, histogram};
use tracing::{debug, trace, warn};

use super::CacheFlags;
use crate::{
    aligned::AlignedBuf,
    config::CacheMode,
    direct_buffer_size,
    error::{StorageError, Teardown},
    init,
    metrics::{DIRECT_BYTES_WRITTEN, DIRECT_FLUSHES, DIRECT_FLUSH_LATENCY, DIRECT_WRITES_OPENED},
    output::IndexOutput,
};

/// A sequential writer over a file opened for direct I/O.
///
/// Bytes collect in a page-aligned buffer that is written out whenever it
/// fills, always at a multiple of the buffer size. On close, the last partial
/// buffer is written as a whole zero-padded block and the file is then
/// truncated to the number of bytes actually written.
///
/// Only one writer may have a given file open at a time.
pub struct DirectOutput {
    path: PathBuf,

    /// `None` once closed.
    file: Option<File>,

    buffer: Option<AlignedBuf>,
    buffer_size: usize,

    /// Number of bytes in `buffer`.
    len: usize,

    /// File offset at which `buffer` will be written.
    flush_offset: u64,

    /// Number of bytes accepted so far.
    real_len: u64,

    hasher: Hasher,
}

impl DirectOutput {
    /// Opens `path` for writing with buffers of `buffer_size` bytes, rounded
    /// up to the page size. The file is created if needed. An existing file is
    /// overwritten and truncated on close.
    ///
    /// Fails with [StorageError::BufferSizeOutOfRange] if the rounded size
    /// exceeds [MAX_DIRECT_BUFFER_SIZE](crate::MAX_DIRECT_BUFFER_SIZE).
    pub fn create(
        path: impl AsRef<Path>,
        buffer_size: usize,
        cache: CacheMode,
    ) -> Result<Self, StorageError> {
        init();
        let path = path.as_ref();
        let buffer_size = direct_buffer_size(buffer_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .cache_flags(cache)
            .open(path)?;
        counter!(DIRECT_WRITES_OPENED).increment(1);
        debug!(
            "opened {} for direct writes with {buffer_size}-byte buffer ({cache:?})",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            buffer: None,
            buffer_size,
            len: 0,
            flush_offset: 0,
            real_len: 0,
            hasher: Hasher::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file(&self) -> Result<&File, StorageError> {
        self.file
            .as_ref()
            .ok_or(StorageError::Closed("direct output"))
    }

    /// Writes out the full buffer and starts a new one.
    fn flush_buffer(&mut self) -> Result<(), StorageError> {
        let file = self.file()?;
        let Some(buffer) = self.buffer.as_ref() else {
            return Ok(());
        };
        let start = Instant::now();
        buffer.write_to(file, self.flush_offset)?;
        histogram!(DIRECT_FLUSH_LATENCY).record(start.elapsed().as_secs_f64());
        counter!(DIRECT_FLUSHES).increment(1);
        counter!(DIRECT_BYTES_WRITTEN).increment(buffer.capacity() as u64);
        trace!(
            "{}: flushed {} bytes at offset {}",
            self.path.display(),
            buffer.capacity(),
            self.flush_offset
        );

        self.flush_offset += buffer.capacity() as u64;
        self.len = 0;
        Ok(())
    }

    /// Writes the partial last block, zero-padded to the buffer size.
    fn write_tail(&mut self) -> Result<(), StorageError> {
        let Some(file) = self.file.as_ref() else {
            return Err(StorageError::Closed("direct output"));
        };
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(());
        };
        if self.len == 0 {
            return Ok(());
        }
        buffer.as_mut_slice()[self.len..].fill(0);
        buffer.write_to(file, self.flush_offset)?;
        counter!(DIRECT_FLUSHES).increment(1);
        counter!(DIRECT_BYTES_WRITTEN).increment(buffer.capacity() as u64);
        self.flush_offset += buffer.capacity() as u64;
        self.len = 0;
        Ok(())
    }
}

impl IndexOutput for DirectOutput {
    fn write_byte(&mut self, byte: u8) -> Result<(), StorageError> {
        self.write_bytes(&[byte])
    }

    fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<(), StorageError> {
        self.file()?;
        let buffer_size = self.buffer_size;
        while !bytes.is_empty() {
            if self.len == buffer_size {
                // A previous flush failed.
                self.flush_buffer()?;
            }
            let buffer = self
                .buffer
                .get_or_insert_with(|| AlignedBuf::with_capacity(buffer_size));
            let n = bytes.len().min(buffer_size - self.len);
            let (chunk, rest) = bytes.split_at(n);
            buffer.as_mut_slice()[self.len..self.len + n].copy_from_slice(chunk);
            self.hasher.update(chunk);
            self.len += n;
            self.real_len += n as u64;
            bytes = rest;

            if self.len == buffer_size {
                self.flush_buffer()?;
            }
        }
        Ok(())
    }

    fn checksum(&mut self) -> Result<u32, StorageError> {
        Ok(self.hasher.clone().finalize())
    }

    fn position(&self) -> u64 {
        self.real_len
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if self.file.is_none() {
            return Ok(());
        }

        let mut teardown = Teardown::new("direct output");
        let tail = self.write_tail();
        teardown.step("write final block", tail);
        if let Some(file) = self.file.take() {
            teardown.step("truncate", file.set_len(self.real_len));
            #[cfg(unix)]
            {
                use std::os::fd::IntoRawFd;
                teardown.step("close", nix::unistd::close(file.into_raw_fd()));
            }
            #[cfg(not(unix))]
            drop(file);
        }
        if let Some(buffer) = self.buffer.take() {
            buffer.free();
        }
        debug!(
            "closed direct output {} at {} bytes",
            self.path.display(),
            self.real_len
        );
        teardown.finish()
    }
}

impl fmt::Debug for DirectOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectOutput")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("buffer_size", &self.buffer_size)
            .field("buffered", &self.len)
            .field("flush_offset", &self.flush_offset)
            .field("position", &self.real_len)
            .finish()
    }
}

impl Drop for DirectOutput {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(
                "error closing direct output {} on drop: {error}",
                self.path.display()
            );
        }
    }
}

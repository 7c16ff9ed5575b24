use std::{
    fmt,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use memmap2::{Advice, Mmap};
use metrics::counter;
use tracing::{debug, warn};

use crate::{
    error::{StorageError, Teardown},
    init,
    metrics::{BYTES_PRELOADED, REGIONS_MAPPED, REGIONS_UNMAPPED},
    page_size,
};

/// One read-only mapping of a whole file.
///
/// The length is fixed when the file is mapped. After [close](Self::close),
/// byte access fails with [StorageError::Closed] and the advice and preload
/// methods do nothing.
pub struct MappedRegion {
    path: PathBuf,

    /// `None` for an empty file, which cannot be mapped, and after close.
    mmap: Option<Mmap>,

    /// `None` after close.
    file: Option<File>,

    length: u64,
    closed: bool,

    /// Whether close asks the kernel to evict the file's cached pages.
    drop_cache_on_close: bool,
}

impl MappedRegion {
    /// Maps all of `path` for reading.
    pub fn map(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        init();
        let path = path.as_ref();
        let file = open_noatime(path)?;
        let length = file.metadata()?.len();
        let mmap = if length > 0 {
            // SAFETY: segment files are immutable once written, so nothing
            // truncates or rewrites the file while it is mapped.
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        counter!(REGIONS_MAPPED).increment(1);
        debug!("mapped {} ({length} bytes)", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            file: Some(file),
            length,
            closed: false,
            drop_cache_on_close: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sets whether [close](Self::close) evicts the file from the page cache.
    /// This is on by default.
    pub fn set_drop_cache_on_close(&mut self, drop_cache: bool) {
        self.drop_cache_on_close = drop_cache;
    }

    /// Returns the mapped bytes.
    pub fn bytes(&self) -> Result<&[u8], StorageError> {
        if self.closed {
            return Err(StorageError::Closed("mapped region"));
        }
        Ok(self.mmap.as_deref().unwrap_or(&[]))
    }

    /// Reads the byte at `offset`.
    pub fn read_byte(&self, offset: u64) -> Result<u8, StorageError> {
        let bytes = self.bytes()?;
        usize::try_from(offset)
            .ok()
            .and_then(|offset| bytes.get(offset).copied())
            .ok_or(StorageError::ReadPastEof {
                position: offset,
                wanted: 1,
                length: self.length,
            })
    }

    /// Fills `dst` from the bytes at `offset`.
    pub fn read_bytes(&self, dst: &mut [u8], offset: u64) -> Result<(), StorageError> {
        let bytes = self.bytes()?;
        let src = usize::try_from(offset)
            .ok()
            .and_then(|start| bytes.get(start..start.checked_add(dst.len())?))
            .ok_or(StorageError::ReadPastEof {
                position: offset,
                wanted: dst.len() as u64,
                length: self.length,
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn advise(&self, advice: Advice) -> Result<(), StorageError> {
        match &self.mmap {
            Some(mmap) if !self.closed => Ok(mmap.advise(advice)?),
            _ => Ok(()),
        }
    }

    /// Tells the kernel the mapping will be read in order.
    pub fn advise_sequential(&self) -> Result<(), StorageError> {
        self.advise(Advice::Sequential)
    }

    /// Tells the kernel the mapping will be read at random, which disables
    /// read-ahead.
    pub fn advise_random(&self) -> Result<(), StorageError> {
        self.advise(Advice::Random)
    }

    pub fn advise_normal(&self) -> Result<(), StorageError> {
        self.advise(Advice::Normal)
    }

    /// Faults the whole mapping into memory.
    pub fn preload(&self) -> Result<(), StorageError> {
        let Some(mmap) = self.mmap.as_ref().filter(|_| !self.closed) else {
            return Ok(());
        };
        mmap.advise(Advice::WillNeed)?;
        let mut sum = 0u8;
        for byte in mmap.iter().step_by(page_size()) {
            sum = sum.wrapping_add(*byte);
        }
        std::hint::black_box(sum);
        counter!(BYTES_PRELOADED).increment(self.length);
        Ok(())
    }

    /// Unmaps the file, evicts it from the page cache if
    /// [drop_cache_on_close](Self::set_drop_cache_on_close) is set, and closes
    /// the descriptor.
    ///
    /// Every step runs even if an earlier one fails. The first failure is
    /// returned. Closing twice is harmless.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut teardown = Teardown::new("mapped region");
        drop(self.mmap.take());
        if let Some(file) = self.file.take() {
            if self.drop_cache_on_close {
                teardown.step("drop cache", drop_cache(&file));
            }
            #[cfg(unix)]
            {
                use std::os::fd::IntoRawFd;
                teardown.step("close", nix::unistd::close(file.into_raw_fd()));
            }
            #[cfg(not(unix))]
            drop(file);
        }
        counter!(REGIONS_UNMAPPED).increment(1);
        debug!("unmapped {}", self.path.display());
        teardown.finish()
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("length", &self.length)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("error unmapping {} on drop: {error}", self.path.display());
        }
    }
}

/// Opens `path` read-only without access-time updates where the platform
/// allows it. `O_NOATIME` is refused for files the caller does not own, in
/// which case the file is opened without it.
fn open_noatime(path: &Path) -> Result<File, StorageError> {
    #[cfg(target_os = "linux")]
    {
        use std::{io::ErrorKind, os::unix::fs::OpenOptionsExt};

        match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOATIME)
            .open(path)
        {
            Err(error) if error.kind() == ErrorKind::PermissionDenied => (),
            result => return Ok(result?),
        }
    }
    Ok(OpenOptions::new().read(true).open(path)?)
}

#[cfg(target_os = "linux")]
fn drop_cache(file: &File) -> Result<(), StorageError> {
    use std::os::fd::AsRawFd;

    // SAFETY: `file` is an open descriptor and a length of 0 covers the whole
    // file.
    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if ret != 0 {
        return Err(std::io::Error::from_raw_os_error(ret).into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn drop_cache(_file: &File) -> Result<(), StorageError> {
    Ok(())
}

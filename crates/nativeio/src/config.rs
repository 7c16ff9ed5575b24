//! Configuration consumed by the native I/O paths.
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::error::StorageError;

/// Default buffer size for direct reads and writes.
pub const DEFAULT_DIRECT_BUFFER_SIZE: usize = 128 * 1024;

/// Largest buffer a direct stream accepts, after rounding up to the page
/// size.
pub const MAX_DIRECT_BUFFER_SIZE: usize = 1 << 30;

/// Default minimum size, in bytes, of a merge or file read with direct I/O.
pub const DEFAULT_MIN_BYTES_DIRECT: u64 = 10 * 1024 * 1024;

/// How direct streams open their files.
#[derive(Copy, Clone, Default, Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Bypass the operating system's page cache (`O_DIRECT`).
    #[default]
    Direct,

    /// Go through the operating system's page cache.
    ///
    /// The buffering and alignment rules of the direct streams still apply.
    /// This exists for file systems, such as tmpfs, that reject `O_DIRECT`.
    PageCache,
}

impl CacheMode {
    #[cfg(unix)]
    pub fn to_custom_open_flags(&self) -> i32 {
        match self {
            CacheMode::PageCache => (),
            CacheMode::Direct => {
                #[cfg(target_os = "linux")]
                return libc::O_DIRECT | libc::O_NOATIME;
            }
        }
        0
    }

    /// Returns the mode that `path`'s file system supports: [CacheMode::Direct]
    /// unless `path` is on tmpfs.
    pub fn for_path(path: &Path) -> Self {
        if is_tmpfs(path) {
            static ONCE: std::sync::Once = std::sync::Once::new();
            ONCE.call_once(|| {
                warn!(
                    "{} is on an in-memory tmpfs filesystem, which does not support direct I/O; using the page cache",
                    path.display()
                )
            });
            CacheMode::PageCache
        } else {
            CacheMode::Direct
        }
    }
}

fn is_tmpfs(_path: &Path) -> bool {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::statfs;
        statfs::statfs(_path).is_ok_and(|s| s.filesystem_type() == statfs::TMPFS_MAGIC)
    }

    #[cfg(not(target_os = "linux"))]
    false
}

/// Forces one I/O path for every file, bypassing the routing rules.
#[derive(Copy, Clone, Default, Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForceIo {
    /// Route each file according to its context and size.
    #[default]
    None,

    /// Read and write every file with direct I/O.
    Direct,

    /// Read every file through a memory mapping.
    Mapped,
}

/// Settings of a [NativeDirectory](crate::directory::NativeDirectory).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Whether searches read through memory mappings. When false, they go to
    /// the delegate path.
    pub mmap_enabled: bool,

    /// Whether mappings keep the kernel's read-ahead. When false, mappings are
    /// advised for random access.
    pub mmap_read_ahead: bool,

    /// Largest file, in bytes, that is preloaded when mapped. 0 means no
    /// limit.
    pub mmap_max_preload_size: u64,

    /// Extensions of the files to preload when mapped, without the leading
    /// dot. `"*"` matches every file.
    pub preload_extensions: Vec<String>,

    /// Whether large merges and large files are read with direct I/O.
    pub direct_read_enabled: bool,

    /// Whether merges and default-context files are written with direct I/O.
    pub direct_write_enabled: bool,

    /// Buffer size of direct inputs. Rounded up to the page size.
    pub direct_read_buffer_size: usize,

    /// Buffer size of direct outputs. Rounded up to the page size.
    pub direct_write_buffer_size: usize,

    /// Merges estimated at this many bytes or more, and files at least this
    /// large, are candidates for direct I/O.
    pub direct_min_merge_size: u64,

    /// Overrides the routing rules.
    pub force_io: ForceIo,

    /// How direct streams open their files.
    pub cache: CacheMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mmap_enabled: true,
            mmap_read_ahead: false,
            mmap_max_preload_size: 0,
            preload_extensions: Vec::new(),
            direct_read_enabled: false,
            direct_write_enabled: false,
            direct_read_buffer_size: DEFAULT_DIRECT_BUFFER_SIZE,
            direct_write_buffer_size: DEFAULT_DIRECT_BUFFER_SIZE,
            direct_min_merge_size: DEFAULT_MIN_BYTES_DIRECT,
            force_io: ForceIo::None,
            cache: CacheMode::Direct,
        }
    }
}

impl StoreConfig {
    /// Checks settings that cannot be expressed by their types.
    pub fn validate(&self) -> Result<(), StorageError> {
        check_buffer_size("direct_read_buffer_size", self.direct_read_buffer_size)?;
        check_buffer_size("direct_write_buffer_size", self.direct_write_buffer_size)
    }

    /// Returns true if `extension` is listed in
    /// [preload_extensions](Self::preload_extensions).
    pub fn preloads_extension(&self, extension: &str) -> bool {
        self.preload_extensions
            .iter()
            .any(|e| e == "*" || e == extension)
    }
}

fn check_buffer_size(field: &'static str, size: usize) -> Result<(), StorageError> {
    if size == 0 {
        return Err(StorageError::InvalidConfig {
            field,
            reason: "must be positive".into(),
        });
    }
    if size > MAX_DIRECT_BUFFER_SIZE {
        return Err(StorageError::InvalidConfig {
            field,
            reason: format!("is {size} bytes, more than the maximum of {MAX_DIRECT_BUFFER_SIZE}"),
        });
    }
    Ok(())
}

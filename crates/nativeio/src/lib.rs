//! Direct I/O and memory-mapped access to search index segment files.
//!
//! Two alternatives to ordinary buffered file access are provided:
//!
//! - [DirectInput] and [DirectOutput] read and write through page-aligned
//!   buffers on files opened with `O_DIRECT`, bypassing the operating system's
//!   page cache.
//!
//! - [MappedInput] reads a file through a memory mapping that is shared by a
//!   tree of slices and clones and unmapped only once its root view closes.
//!
//! [NativeDirectory] picks one of them per file according to a [StoreConfig]
//! and the caller's [IoContext].

use std::sync::{Once, OnceLock};

pub mod aligned;
pub mod config;
pub mod direct;
pub mod directory;
pub mod error;
pub mod input;
pub mod metrics;
pub mod mmap;
pub mod output;
pub mod policy;


pub use aligned::AlignedBuf;
pub use config::{CacheMode, ForceIo, StoreConfig, MAX_DIRECT_BUFFER_SIZE};
pub use direct::{DirectInput, DirectOutput};
pub use directory::{Input, NativeDirectory, Output, PlainInput, PlainOutput};
pub use error::StorageError;
pub use input::{IndexInput, RandomAccessInput};
pub use mmap::{MappedGuard, MappedInput, MappedRegion};
pub use output::IndexOutput;
pub use policy::{IoContext, IoPath};

/// Page size assumed when the system cannot report one.
const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Performs process-wide initialization: caches the system page size and
/// describes the crate's metrics.
///
/// Calling this more than once is harmless. The streams call it themselves,
/// so calling it up front only moves the one-time cost.
pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let page_size = page_size();
        tracing::debug!("native I/O initialized with {page_size}-byte pages");
        metrics::describe_metrics();
    });
}

/// Returns the system page size.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    use nix::unistd::{sysconf, SysconfVar};

    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        result => {
            tracing::warn!(
                "could not determine page size ({result:?}), assuming {FALLBACK_PAGE_SIZE} bytes"
            );
            FALLBACK_PAGE_SIZE
        }
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

/// Rounds `size` up to a multiple of the page size. A `size` of 0 rounds up
/// to one page. Returns `None` if the result does not fit in a `usize`.
pub fn round_up_to_page(size: usize) -> Option<usize> {
    let page = page_size();
    size.max(1).div_ceil(page).checked_mul(page)
}

/// Rounds a requested direct I/O buffer size up to the page size, failing if
/// the result would exceed [MAX_DIRECT_BUFFER_SIZE].
pub(crate) fn direct_buffer_size(size: usize) -> Result<usize, StorageError> {
    round_up_to_page(size)
        .filter(|&rounded| rounded <= MAX_DIRECT_BUFFER_SIZE)
        .ok_or(StorageError::BufferSizeOutOfRange {
            size,
            max: MAX_DIRECT_BUFFER_SIZE,
        })
}

//! Buffered streams over files opened for direct I/O.
//!
//! Every transfer between a stream and its file moves whole, page-aligned
//! buffers at page-aligned offsets, which is what `O_DIRECT` demands. The
//! streams allocate their buffers on first use.

use std::fs::OpenOptions;

use crate::config::CacheMode;

mod input;
mod output;

pub use input::DirectInput;
pub use output::DirectOutput;

/// Applies a [CacheMode] to [OpenOptions].
pub(crate) trait CacheFlags {
    fn cache_flags(&mut self, cache: CacheMode) -> &mut Self;
}

impl CacheFlags for OpenOptions {
    fn cache_flags(&mut self, cache: CacheMode) -> &mut Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            self.custom_flags(cache.to_custom_open_flags());
        }
        self
    }
}

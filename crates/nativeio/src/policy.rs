//! Chooses an I/O path per file.
//!
//! The functions here are pure: they look only at the configuration, the
//! caller's [IoContext] and the file's name or size.

use serde::{Deserialize, Serialize};

use crate::config::{ForceIo, StoreConfig};

/// Extensions that are never written with direct I/O in [IoContext::Default].
///
/// Stored fields and field infos are written in the same context as restored
/// files but are small or rewritten often.
const DIRECT_EXCLUDED_EXTENSIONS: [&str; 3] = ["fnm", "fdt", "fdx"];

/// Why a file is being opened.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoContext {
    /// A search. `read_once` marks files that are read through once, such as
    /// checksums being verified.
    Read { read_once: bool },

    /// A merge expected to produce `estimated_bytes` bytes.
    Merge { estimated_bytes: u64 },

    /// A flush of newly indexed documents.
    Flush,

    /// Anything else, including restoring files from a snapshot.
    Default,
}

/// An I/O path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoPath {
    /// [DirectInput](crate::DirectInput) or [DirectOutput](crate::DirectOutput).
    Direct,

    /// [MappedInput](crate::MappedInput).
    Mapped,

    /// Ordinary reads and writes through the page cache.
    Delegate,
}

impl IoPath {
    fn direct_if(enabled: bool) -> Self {
        if enabled {
            IoPath::Direct
        } else {
            IoPath::Delegate
        }
    }
}

/// Returns the extension of `name`: what follows its last `.`, or the empty
/// string if it has none.
pub fn extension(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

fn is_large_merge(config: &StoreConfig, context: IoContext) -> bool {
    matches!(context, IoContext::Merge { estimated_bytes } if estimated_bytes >= config.direct_min_merge_size)
}

/// Chooses how to read a file of `file_size` bytes in `context`.
pub fn select_input(config: &StoreConfig, context: IoContext, file_size: u64) -> IoPath {
    match config.force_io {
        ForceIo::Direct => return IoPath::Direct,
        ForceIo::Mapped => return IoPath::Mapped,
        ForceIo::None => (),
    }
    if let IoContext::Read { read_once: false } = context {
        // Searches revisit the same pages, so they stay cached.
        if config.mmap_enabled {
            IoPath::Mapped
        } else {
            IoPath::Delegate
        }
    } else if is_large_merge(config, context) || file_size >= config.direct_min_merge_size {
        IoPath::direct_if(config.direct_read_enabled)
    } else {
        IoPath::Delegate
    }
}

/// Chooses how to write `file_name` in `context`.
pub fn select_output(config: &StoreConfig, context: IoContext, file_name: &str) -> IoPath {
    if config.force_io == ForceIo::Direct {
        IoPath::Direct
    } else if is_large_merge(config, context) {
        IoPath::direct_if(config.direct_write_enabled)
    } else if context == IoContext::Default {
        if DIRECT_EXCLUDED_EXTENSIONS.contains(&extension(file_name)) {
            IoPath::Delegate
        } else {
            IoPath::direct_if(config.direct_write_enabled)
        }
    } else {
        IoPath::Delegate
    }
}

/// Returns whether a freshly mapped `file_name` of `length` bytes should be
/// preloaded.
pub fn should_preload(config: &StoreConfig, file_name: &str, length: u64) -> bool {
    config.preloads_extension(extension(file_name))
        && (config.mmap_max_preload_size == 0 || length <= config.mmap_max_preload_size)
}

#[cfg(test)]
mod tests {
    use super::{extension, select_input, select_output, should_preload, IoContext, IoPath};
    use crate::config::{ForceIo, StoreConfig};

    const MIB: u64 = 1024 * 1024;

    fn enabled() -> StoreConfig {
        StoreConfig {
            direct_read_enabled: true,
            direct_write_enabled: true,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn extensions() {
        assert_eq!(extension("_0.fdt"), "fdt");
        assert_eq!(extension("_0_Lucene90_0.doc"), "doc");
        assert_eq!(extension("segments_3"), "");
    }

    #[test]
    fn input_routing() {
        let search = IoContext::Read { read_once: false };
        let once = IoContext::Read { read_once: true };
        let big_merge = IoContext::Merge {
            estimated_bytes: 10 * MIB,
        };
        let small_merge = IoContext::Merge {
            estimated_bytes: MIB,
        };

        let config = enabled();
        assert_eq!(select_input(&config, search, 100 * MIB), IoPath::Mapped);
        assert_eq!(select_input(&config, big_merge, 0), IoPath::Direct);
        assert_eq!(select_input(&config, small_merge, 0), IoPath::Delegate);
        assert_eq!(select_input(&config, small_merge, 10 * MIB), IoPath::Direct);
        assert_eq!(select_input(&config, once, 20 * MIB), IoPath::Direct);
        assert_eq!(select_input(&config, once, MIB), IoPath::Delegate);
        assert_eq!(select_input(&config, IoContext::Flush, 0), IoPath::Delegate);

        let config = StoreConfig::default();
        assert_eq!(select_input(&config, big_merge, 0), IoPath::Delegate);
        assert_eq!(select_input(&config, once, 20 * MIB), IoPath::Delegate);

        let config = StoreConfig {
            mmap_enabled: false,
            ..enabled()
        };
        assert_eq!(select_input(&config, search, 0), IoPath::Delegate);
    }

    #[test]
    fn forced_input() {
        let search = IoContext::Read { read_once: false };
        let config = StoreConfig {
            force_io: ForceIo::Direct,
            ..StoreConfig::default()
        };
        assert_eq!(select_input(&config, search, 0), IoPath::Direct);
        assert_eq!(
            select_output(&config, IoContext::Flush, "_0.fdt"),
            IoPath::Direct
        );

        let config = StoreConfig {
            force_io: ForceIo::Mapped,
            mmap_enabled: false,
            ..StoreConfig::default()
        };
        assert_eq!(select_input(&config, IoContext::Flush, 0), IoPath::Mapped);
        assert_eq!(
            select_output(&config, IoContext::Default, "_0.doc"),
            IoPath::Delegate
        );
    }

    #[test]
    fn output_routing() {
        let big_merge = IoContext::Merge {
            estimated_bytes: 64 * MIB,
        };
        let config = enabled();
        assert_eq!(select_output(&config, big_merge, "_1.fdt"), IoPath::Direct);
        assert_eq!(
            select_output(&config, IoContext::Default, "_1.doc"),
            IoPath::Direct
        );
        for name in ["_1.fnm", "_1.fdt", "_1.fdx"] {
            assert_eq!(
                select_output(&config, IoContext::Default, name),
                IoPath::Delegate
            );
        }
        assert_eq!(
            select_output(&config, IoContext::Flush, "_1.doc"),
            IoPath::Delegate
        );
        assert_eq!(
            select_output(&StoreConfig::default(), big_merge, "_1.doc"),
            IoPath::Delegate
        );
    }

    #[test]
    fn preload() {
        let config = StoreConfig {
            preload_extensions: vec!["tip".into(), "dvd".into()],
            ..StoreConfig::default()
        };
        assert!(should_preload(&config, "_0.tip", 1 << 40));
        assert!(!should_preload(&config, "_0.doc", 1));

        let config = StoreConfig {
            preload_extensions: vec!["*".into()],
            mmap_max_preload_size: MIB,
            ..StoreConfig::default()
        };
        assert!(should_preload(&config, "_0.doc", MIB));
        assert!(!should_preload(&config, "_0.doc", MIB + 1));

        assert!(!should_preload(&StoreConfig::default(), "_0.tip", 1));
    }
}

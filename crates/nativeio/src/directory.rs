//! A directory of segment files that opens each file on the I/O path chosen
//! by [policy](crate::policy).

use std::{
    fmt,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use crc32fast::Hasher;
use tracing::{debug, warn};

use crate::{
    config::{CacheMode, StoreConfig},
    direct::{DirectInput, DirectOutput},
    error::StorageError,
    init,
    input::IndexInput,
    mmap::{MappedGuard, MappedInput, MappedRegion},
    output::IndexOutput,
    policy::{select_input, select_output, should_preload, IoContext, IoPath},
};

/// Opens files under one root directory according to a [StoreConfig].
#[derive(Debug)]
pub struct NativeDirectory {
    root: PathBuf,
    config: StoreConfig,
}

impl NativeDirectory {
    /// Returns a directory rooted at `root`.
    ///
    /// If `config` asks for [CacheMode::Direct] but `root` is on a file system
    /// that refuses direct I/O, the direct streams use the page cache instead.
    pub fn new(root: impl AsRef<Path>, mut config: StoreConfig) -> Result<Self, StorageError> {
        init();
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        if config.cache == CacheMode::Direct {
            config.cache = CacheMode::for_path(&root);
        }
        debug!("opened directory {} with {config:?}", root.display());
        Ok(Self { root, config })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Opens `name` for reading in `context`.
    pub fn open_input(&self, name: &str, context: IoContext) -> Result<Input, StorageError> {
        let path = self.root.join(name);
        let file_size = fs::metadata(&path)?.len();
        let io_path = select_input(&self.config, context, file_size);
        debug!("opening {name} for reading on {io_path:?} path ({context:?})");
        Ok(match io_path {
            IoPath::Direct => Input::Direct(DirectInput::open(
                &path,
                self.config.direct_read_buffer_size,
                self.config.cache,
            )?),
            IoPath::Mapped => Input::Mapped(self.open_mapped(&path, name)?),
            IoPath::Delegate => Input::Plain(PlainInput::open(&path)?),
        })
    }

    fn open_mapped(&self, path: &Path, name: &str) -> Result<MappedInput, StorageError> {
        let region = MappedRegion::map(path)?;
        if should_preload(&self.config, name, region.length()) {
            region.preload()?;
        }
        if !self.config.mmap_read_ahead {
            region.advise_random()?;
        }
        MappedInput::new_root(MappedGuard::new(region))
    }

    /// Creates `name` for writing in `context`.
    pub fn create_output(&self, name: &str, context: IoContext) -> Result<Output, StorageError> {
        let path = self.root.join(name);
        let io_path = select_output(&self.config, context, name);
        debug!("creating {name} for writing on {io_path:?} path ({context:?})");
        Ok(match io_path {
            IoPath::Direct => Output::Direct(DirectOutput::create(
                &path,
                self.config.direct_write_buffer_size,
                self.config.cache,
            )?),
            IoPath::Mapped | IoPath::Delegate => Output::Plain(PlainOutput::create(&path)?),
        })
    }
}

/// An input opened by a [NativeDirectory].
#[derive(Debug)]
pub enum Input {
    Direct(DirectInput),
    Mapped(MappedInput),
    Plain(PlainInput),
}

impl Input {
    pub fn io_path(&self) -> IoPath {
        match self {
            Input::Direct(_) => IoPath::Direct,
            Input::Mapped(_) => IoPath::Mapped,
            Input::Plain(_) => IoPath::Delegate,
        }
    }
}

macro_rules! for_each_input {
    ($input:expr, $inner:ident => $body:expr) => {
        match $input {
            Input::Direct($inner) => $body,
            Input::Mapped($inner) => $body,
            Input::Plain($inner) => $body,
        }
    };
}

impl IndexInput for Input {
    fn read_byte(&mut self) -> Result<u8, StorageError> {
        for_each_input!(self, input => input.read_byte())
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), StorageError> {
        for_each_input!(self, input => input.read_bytes(dst))
    }

    fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        for_each_input!(self, input => input.seek(pos))
    }

    fn position(&self) -> u64 {
        for_each_input!(self, input => input.position())
    }

    fn length(&self) -> Result<u64, StorageError> {
        for_each_input!(self, input => input.length())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        for_each_input!(self, input => input.close())
    }

    fn try_clone(&self) -> Result<Self, StorageError> {
        Ok(match self {
            Input::Direct(input) => Input::Direct(input.try_clone()?),
            Input::Mapped(input) => Input::Mapped(input.try_clone()?),
            Input::Plain(input) => Input::Plain(input.try_clone()?),
        })
    }
}

/// An output created by a [NativeDirectory].
#[derive(Debug)]
pub enum Output {
    Direct(DirectOutput),
    Plain(PlainOutput),
}

impl Output {
    pub fn io_path(&self) -> IoPath {
        match self {
            Output::Direct(_) => IoPath::Direct,
            Output::Plain(_) => IoPath::Delegate,
        }
    }
}

impl IndexOutput for Output {
    fn write_byte(&mut self, byte: u8) -> Result<(), StorageError> {
        match self {
            Output::Direct(output) => output.write_byte(byte),
            Output::Plain(output) => output.write_byte(byte),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        match self {
            Output::Direct(output) => output.write_bytes(bytes),
            Output::Plain(output) => output.write_bytes(bytes),
        }
    }

    fn checksum(&mut self) -> Result<u32, StorageError> {
        match self {
            Output::Direct(output) => output.checksum(),
            Output::Plain(output) => output.checksum(),
        }
    }

    fn position(&self) -> u64 {
        match self {
            Output::Direct(output) => output.position(),
            Output::Plain(output) => output.position(),
        }
    }

    fn close(&mut self) -> Result<(), StorageError> {
        match self {
            Output::Direct(output) => output.close(),
            Output::Plain(output) => output.close(),
        }
    }
}

/// A reader that goes through the page cache with positioned reads. Clones
/// share the file.
#[derive(Debug)]
pub struct PlainInput {
    path: PathBuf,

    /// `None` once closed.
    file: Option<Arc<File>>,
    pos: u64,
}

impl PlainInput {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(Arc::new(File::open(path)?)),
            pos: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File, StorageError> {
        self.file
            .as_deref()
            .ok_or(StorageError::Closed("plain input"))
    }
}

impl IndexInput for PlainInput {
    fn read_byte(&mut self) -> Result<u8, StorageError> {
        let mut byte = [0];
        self.read_bytes(&mut byte)?;
        Ok(byte[0])
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), StorageError> {
        let length = self.length()?;
        let wanted = dst.len() as u64;
        if length.saturating_sub(self.pos) < wanted {
            return Err(StorageError::ReadPastEof {
                position: self.pos,
                wanted,
                length,
            });
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file()?.read_exact_at(dst, self.pos)?;
        }
        self.pos += wanted;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        let length = self.length()?;
        if pos > length {
            return Err(StorageError::SeekPastEof {
                position: pos,
                length,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> Result<u64, StorageError> {
        Ok(self.file()?.metadata()?.len())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.file = None;
        Ok(())
    }

    fn try_clone(&self) -> Result<Self, StorageError> {
        self.file()?;
        Ok(Self {
            path: self.path.clone(),
            file: self.file.clone(),
            pos: self.pos,
        })
    }
}

/// A writer that goes through the page cache.
pub struct PlainOutput {
    path: PathBuf,

    /// `None` once closed.
    writer: Option<BufWriter<File>>,
    len: u64,
    hasher: Hasher,
}

impl PlainOutput {
    /// Creates `path`, truncating it if it exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(File::create(path)?)),
            len: 0,
            hasher: Hasher::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IndexOutput for PlainOutput {
    fn write_byte(&mut self, byte: u8) -> Result<(), StorageError> {
        self.write_bytes(&[byte])
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(StorageError::Closed("plain output"))?;
        writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
        Ok(())
    }

    fn checksum(&mut self) -> Result<u32, StorageError> {
        Ok(self.hasher.clone().finalize())
    }

    fn position(&self) -> u64 {
        self.len
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(writer) = self.writer.take() {
            writer.into_inner().map_err(|error| error.into_error())?;
            debug!("closed plain output {} at {} bytes", self.path.display(), self.len);
        }
        Ok(())
    }
}

impl fmt::Debug for PlainOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainOutput")
            .field("path", &self.path)
            .field("open", &self.writer.is_some())
            .field("position", &self.len)
            .finish()
    }
}

impl Drop for PlainOutput {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(
                "error closing plain output {} on drop: {error}",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::{
        config::{ForceIo, StoreConfig},
        error::StorageError,
        input::IndexInput,
        output::IndexOutput,
        policy::{IoContext, IoPath},
        test::{init_test_logger, random_bytes, test_dir, write_file},
    };

    use super::{NativeDirectory, PlainInput, PlainOutput};

    const SEARCH: IoContext = IoContext::Read { read_once: false };

    #[test]
    fn plain_streams() {
        init_test_logger();
        let dir = test_dir();
        let path = dir.path().join("plain");
        let data = random_bytes(1000);

        let mut output = PlainOutput::create(&path).unwrap();
        output.write_bytes(&data[..10]).unwrap();
        output.write_byte(data[10]).unwrap();
        output.write_bytes(&data[11..]).unwrap();
        assert_eq!(output.position(), 1000);
        assert_eq!(output.checksum().unwrap(), crc32fast::hash(&data));
        output.close().unwrap();
        output.close().unwrap();
        assert_eq!(
            output.write_byte(0),
            Err(StorageError::Closed("plain output"))
        );

        let mut input = PlainInput::open(&path).unwrap();
        input.seek(990).unwrap();
        let mut clone = input.try_clone().unwrap();
        let mut dst = [0; 10];
        input.read_bytes(&mut dst).unwrap();
        assert_eq!(dst, data[990..]);
        assert!(input.read_byte().unwrap_err().is_eof());
        assert_eq!(clone.read_byte().unwrap(), data[990]);
        input.close().unwrap();
        assert_eq!(input.read_byte(), Err(StorageError::Closed("plain input")));
        assert_eq!(clone.read_byte().unwrap(), data[991]);
    }

    #[test]
    fn routes_by_context() {
        init_test_logger();
        let dir = test_dir();
        let config = StoreConfig {
            direct_read_enabled: true,
            direct_write_enabled: true,
            direct_min_merge_size: 4096,
            preload_extensions: vec!["*".into()],
            ..StoreConfig::default()
        };
        let directory = NativeDirectory::new(dir.path(), config).unwrap();
        let data = random_bytes(10_000);

        let merge = IoContext::Merge {
            estimated_bytes: 1 << 20,
        };
        let mut output = directory.create_output("_0.doc", merge).unwrap();
        assert_eq!(output.io_path(), IoPath::Direct);
        output.write_bytes(&data).unwrap();
        let checksum = output.checksum().unwrap();
        output.close().unwrap();

        let mut output = directory
            .create_output("_0.fdt", IoContext::Default)
            .unwrap();
        assert_eq!(output.io_path(), IoPath::Delegate);
        output.write_bytes(b"stored").unwrap();
        output.close().unwrap();

        let mut mapped = directory.open_input("_0.doc", SEARCH).unwrap();
        assert_eq!(mapped.io_path(), IoPath::Mapped);
        let mut direct = directory.open_input("_0.doc", merge).unwrap();
        assert_eq!(direct.io_path(), IoPath::Direct);
        let mut plain = directory.open_input("_0.fdt", IoContext::Flush).unwrap();
        assert_eq!(plain.io_path(), IoPath::Delegate);

        for input in [&mut mapped, &mut direct] {
            let mut read = vec![0; data.len()];
            input.read_bytes(&mut read).unwrap();
            assert_eq!(crc32fast::hash(&read), checksum);
            let mut clone = input.try_clone().unwrap();
            clone.seek(5).unwrap();
            assert_eq!(clone.read_byte().unwrap(), data[5]);
            input.close().unwrap();
        }
        let mut stored = [0; 6];
        plain.read_bytes(&mut stored).unwrap();
        assert_eq!(&stored, b"stored");
        plain.close().unwrap();

        assert_eq!(fs::read(dir.path().join("_0.doc")).unwrap(), data);
    }

    #[test]
    fn forced_paths() {
        init_test_logger();
        let dir = test_dir();
        fs::write(dir.path().join("small"), b"tiny").unwrap();

        let mapped = NativeDirectory::new(
            dir.path(),
            StoreConfig {
                force_io: ForceIo::Mapped,
                ..StoreConfig::default()
            },
        )
        .unwrap();
        let input = mapped.open_input("small", IoContext::Flush).unwrap();
        assert_eq!(input.io_path(), IoPath::Mapped);

        let direct = NativeDirectory::new(
            dir.path(),
            StoreConfig {
                force_io: ForceIo::Direct,
                ..StoreConfig::default()
            },
        )
        .unwrap();
        let mut input = direct.open_input("small", SEARCH).unwrap();
        assert_eq!(input.io_path(), IoPath::Direct);
        assert_eq!(input.read_u32().unwrap(), u32::from_le_bytes(*b"tiny"));
    }

    #[test]
    fn missing_and_invalid() {
        init_test_logger();
        let dir = test_dir();
        let directory = NativeDirectory::new(dir.path(), StoreConfig::default()).unwrap();
        let error = directory.open_input("missing", SEARCH).unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::NotFound);

        let config = StoreConfig {
            direct_write_buffer_size: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            NativeDirectory::new(dir.path(), config).unwrap_err(),
            StorageError::InvalidConfig {
                field: "direct_write_buffer_size",
                ..
            }
        ));
    }

    #[test]
    fn debug_output() {
        init_test_logger();
        let dir = test_dir();
        write_file(&dir.path().join("_0.tip"), b"debug");
        let directory = NativeDirectory::new(dir.path(), StoreConfig::default()).unwrap();
        let input = directory.open_input("_0.tip", SEARCH).unwrap();
        assert!(format!("{input:?}").starts_with("Mapped(MappedInput {"));

        let output = directory.create_output("_1.tip", IoContext::Flush).unwrap();
        assert!(format!("{output:?}").contains("open: true"));
    }
}

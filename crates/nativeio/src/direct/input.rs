use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use metrics::counter;
use tracing::{debug, trace, warn};

use super::CacheFlags;
use crate::{
    aligned::AlignedBuf,
    config::CacheMode,
    direct_buffer_size,
    error::{StorageError, Teardown},
    init,
    input::IndexInput,
    metrics::{DIRECT_BYTES_READ, DIRECT_READS_OPENED, DIRECT_REFILLS},
};

/// A reader's buffer. Clones share theirs with the root's registry, so that
/// closing the root can free it.
type BufferSlot = Arc<Mutex<Option<AlignedBuf>>>;

/// Buffers of the live clones of one [DirectInput], by handle.
#[derive(Debug, Default)]
struct CloneRegistry {
    next: usize,
    live: BTreeMap<usize, BufferSlot>,
}

/// State shared by a root [DirectInput] and all of its clones.
#[derive(Debug)]
struct SharedFile {
    path: PathBuf,

    /// `None` once the root closes.
    file: RwLock<Option<File>>,
    closed: AtomicBool,
    clones: Mutex<CloneRegistry>,
}

impl SharedFile {
    fn with_file<T>(
        &self,
        f: impl FnOnce(&File) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        match self.file.read().unwrap().as_ref() {
            Some(file) => f(file),
            None => Err(StorageError::Closed("direct input")),
        }
    }

    fn register(&self, buffer: BufferSlot) -> usize {
        let mut clones = self.clones.lock().unwrap();
        let id = clones.next;
        clones.next += 1;
        clones.live.insert(id, buffer);
        id
    }

    fn deregister(&self, id: usize) {
        self.clones.lock().unwrap().live.remove(&id);
    }

    /// Empties the registry and frees every clone's buffer. Returns the
    /// number of clones that were registered.
    fn release_clones(&self) -> usize {
        let live = std::mem::take(&mut self.clones.lock().unwrap().live);
        for slot in live.values() {
            if let Some(buffer) = slot.lock().unwrap().take() {
                buffer.free();
            }
        }
        live.len()
    }
}

/// Cursor and buffered window of one reader.
#[derive(Debug)]
struct Window {
    buffer_size: usize,

    /// File offset of the first byte in the buffer, a multiple of
    /// `buffer_size`.
    buffer_pos: u64,

    /// Number of valid bytes in the buffer.
    limit: usize,

    /// Whether the buffer holds `limit` bytes read at `buffer_pos`.
    ///
    /// Moving the cursor out of the window leaves this set, so coming back
    /// to it does not read it again.
    resident: bool,

    /// Logical read position.
    pos: u64,

    refills: u64,
}

impl Window {
    fn new(buffer_size: usize, pos: u64) -> Self {
        Self {
            buffer_size,
            buffer_pos: 0,
            limit: 0,
            resident: false,
            pos,
            refills: 0,
        }
    }

    fn contains(&self, pos: u64) -> bool {
        self.resident
            && pos >= self.buffer_pos
            && pos - self.buffer_pos < self.buffer_size as u64
    }

    /// Offset of `pos` in the buffer. Only valid while `contains(pos)`.
    fn cursor(&self) -> usize {
        (self.pos - self.buffer_pos) as usize
    }

    /// Loads the window containing `pos`.
    fn refill(
        &mut self,
        shared: &SharedFile,
        buffer: &mut Option<AlignedBuf>,
    ) -> Result<(), StorageError> {
        let size = self.buffer_size as u64;
        let window_start = self.pos / size * size;
        let buffer_size = self.buffer_size;
        let buffer = buffer.get_or_insert_with(|| AlignedBuf::with_capacity(buffer_size));
        self.resident = false;
        self.limit = shared.with_file(|file| {
            if window_start < file.metadata()?.len() {
                Ok(buffer.read_from(file, window_start)?)
            } else {
                Ok(0)
            }
        })?;
        self.buffer_pos = window_start;
        self.resident = true;
        self.refills += 1;
        counter!(DIRECT_REFILLS).increment(1);
        counter!(DIRECT_BYTES_READ).increment(self.limit as u64);
        trace!(
            "{}: refilled {} bytes at offset {window_start}",
            shared.path.display(),
            self.limit
        );
        Ok(())
    }

    /// Returns the number of bytes available in the buffer at the cursor.
    ///
    /// Refills if the cursor is outside the resident window, or at the end
    /// of a short window in case the file has grown. 0 means end of file.
    fn fill(
        &mut self,
        shared: &SharedFile,
        buffer: &mut Option<AlignedBuf>,
    ) -> Result<usize, StorageError> {
        if buffer.is_none() || !self.contains(self.pos) || self.cursor() >= self.limit {
            self.refill(shared, buffer)?;
        }
        Ok(self.limit.saturating_sub(self.cursor()))
    }

    /// Returns the valid part of `buffer`.
    fn buffered<'a>(&self, buffer: &'a Option<AlignedBuf>) -> &'a [u8] {
        buffer
            .as_ref()
            .map_or(&[][..], |buffer| &buffer.as_slice()[..self.limit])
    }
}

/// A reader over a file opened for direct I/O.
///
/// The reader keeps one window of the file, `buffer_size` bytes long and
/// starting at a multiple of `buffer_size`, in a page-aligned buffer. Reads
/// that fall outside the window refill it.
///
/// [try_clone](IndexInput::try_clone) yields readers that share the file
/// handle but have their own buffer and cursor. Closing the original reader
/// (the root) closes the file for all of them: the root keeps a registry of
/// its clones' buffers and frees them all, and a clone used afterward fails
/// with [StorageError::Closed].
#[derive(Debug)]
pub struct DirectInput {
    shared: Arc<SharedFile>,

    /// `None` for the root.
    clone_id: Option<usize>,

    /// Allocated by the first refill.
    buffer: BufferSlot,

    window: Window,
}

impl DirectInput {
    /// Opens `path` for reading with buffers of `buffer_size` bytes, rounded
    /// up to the page size.
    ///
    /// Fails with [StorageError::BufferSizeOutOfRange] if the rounded size
    /// exceeds [MAX_DIRECT_BUFFER_SIZE](crate::MAX_DIRECT_BUFFER_SIZE).
    pub fn open(
        path: impl AsRef<Path>,
        buffer_size: usize,
        cache: CacheMode,
    ) -> Result<Self, StorageError> {
        init();
        let path = path.as_ref();
        let buffer_size = direct_buffer_size(buffer_size)?;
        let file = OpenOptions::new()
            .read(true)
            .cache_flags(cache)
            .open(path)?;
        counter!(DIRECT_READS_OPENED).increment(1);
        debug!(
            "opened {} for direct reads with {buffer_size}-byte buffer ({cache:?})",
            path.display()
        );
        Ok(Self {
            shared: Arc::new(SharedFile {
                path: path.to_path_buf(),
                file: RwLock::new(Some(file)),
                closed: AtomicBool::new(false),
                clones: Mutex::new(CloneRegistry::default()),
            }),
            clone_id: None,
            buffer: BufferSlot::default(),
            window: Window::new(buffer_size, 0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Returns the buffer size, a multiple of the page size.
    pub fn buffer_size(&self) -> usize {
        self.window.buffer_size
    }

    pub fn is_clone(&self) -> bool {
        self.clone_id.is_some()
    }

    /// Returns how many times this reader has refilled its buffer.
    pub fn refills(&self) -> u64 {
        self.window.refills
    }

    /// Returns the number of live clones registered with the root.
    pub fn registered_clones(&self) -> usize {
        self.shared.clones.lock().unwrap().live.len()
    }

    /// Fails if the root has closed, releasing `buffer`.
    fn ensure_open(&self, buffer: &mut Option<AlignedBuf>) -> Result<(), StorageError> {
        if !self.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(buffer) = buffer.take() {
            buffer.free();
        }
        Err(StorageError::Closed(if self.is_clone() {
            "direct input clone"
        } else {
            "direct input"
        }))
    }

    fn past_eof(&self, position: u64, wanted: u64) -> StorageError {
        match self.length() {
            Ok(length) => StorageError::ReadPastEof {
                position,
                wanted,
                length,
            },
            Err(error) => error,
        }
    }
}

impl IndexInput for DirectInput {
    fn read_byte(&mut self) -> Result<u8, StorageError> {
        let mut buffer = self.buffer.lock().unwrap();
        self.ensure_open(&mut buffer)?;
        if self.window.fill(&self.shared, &mut buffer)? == 0 {
            return Err(self.past_eof(self.window.pos, 1));
        }
        let byte = self.window.buffered(&buffer)[self.window.cursor()];
        self.window.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), StorageError> {
        let mut buffer = self.buffer.lock().unwrap();
        self.ensure_open(&mut buffer)?;
        let start = self.window.pos;
        let mut done = 0;
        while done < dst.len() {
            let available = match self.window.fill(&self.shared, &mut buffer) {
                Ok(0) => {
                    self.window.pos = start;
                    return Err(self.past_eof(start, dst.len() as u64));
                }
                Ok(available) => available,
                Err(error) => {
                    self.window.pos = start;
                    return Err(error);
                }
            };
            let n = available.min(dst.len() - done);
            let cursor = self.window.cursor();
            let buffered = self.window.buffered(&buffer);
            dst[done..done + n].copy_from_slice(&buffered[cursor..cursor + n]);
            done += n;
            self.window.pos += n as u64;
        }
        Ok(())
    }

    /// Moves the cursor to `pos`. A later read inside the resident window
    /// does no I/O.
    fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        self.ensure_open(&mut self.buffer.lock().unwrap())?;
        let length = self.length()?;
        if pos > length {
            return Err(StorageError::SeekPastEof {
                position: pos,
                length,
            });
        }
        self.window.pos = pos;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.window.pos
    }

    fn length(&self) -> Result<u64, StorageError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed("direct input"));
        }
        self.shared.with_file(|file| Ok(file.metadata()?.len()))
    }

    /// Closes the file for this reader and all of its clones, and frees
    /// every buffer.
    ///
    /// Closing a clone does nothing: its buffer and registry slot are released
    /// when it is dropped or when the root closes.
    fn close(&mut self) -> Result<(), StorageError> {
        if self.is_clone() || self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut teardown = Teardown::new("direct input");
        if let Some(file) = self.shared.file.write().unwrap().take() {
            #[cfg(unix)]
            {
                use std::os::fd::IntoRawFd;
                teardown.step("close", nix::unistd::close(file.into_raw_fd()));
            }
            #[cfg(not(unix))]
            drop(file);
        }
        if let Some(buffer) = self.buffer.lock().unwrap().take() {
            buffer.free();
        }
        self.window.resident = false;

        let released = self.shared.release_clones();
        debug!(
            "closed direct input {} and {released} clone(s)",
            self.shared.path.display()
        );
        teardown.finish()
    }

    fn try_clone(&self) -> Result<Self, StorageError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed("direct input"));
        }
        let buffer = BufferSlot::default();
        let id = self.shared.register(buffer.clone());
        Ok(Self {
            shared: self.shared.clone(),
            clone_id: Some(id),
            buffer,
            window: Window::new(self.window.buffer_size, self.window.pos),
        })
    }
}

impl Drop for DirectInput {
    fn drop(&mut self) {
        match self.clone_id {
            Some(id) => self.shared.deregister(id),
            None => {
                if let Err(error) = self.close() {
                    warn!(
                        "error closing direct input {} on drop: {error}",
                        self.shared.path.display()
                    );
                }
            }
        }
    }
}

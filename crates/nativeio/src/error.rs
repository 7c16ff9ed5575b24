use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

/// An error that can occur when reading or writing through a native I/O path.
#[derive(Clone, Error, Debug, Serialize, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    #[serde(serialize_with = "serialize_io_error")]
    StdIo(ErrorKind),

    /// A slice was requested at or beyond the end of its parent window.
    #[error("Slice offset {offset} is past the end of a window of {length} bytes.")]
    SliceOffsetPastEnd { offset: u64, length: u64 },

    /// A slice starts inside its parent window but extends past its end.
    #[error("Slice of {slice_length} bytes at offset {offset} exceeds a window of {length} bytes.")]
    SliceTooLong {
        offset: u64,
        slice_length: u64,
        length: u64,
    },

    /// Seek beyond the current end of the file or window.
    #[error("Cannot seek to position {position}, length is {length}.")]
    SeekPastEof { position: u64, length: u64 },

    /// A read needed more bytes than the file or window can supply.
    ///
    /// Partial reads are never reported as success: if any requested byte is
    /// missing, the whole read fails with this error.
    #[error("Read past EOF: wanted {wanted} bytes at position {position}, length is {length}.")]
    ReadPastEof {
        position: u64,
        wanted: u64,
        length: u64,
    },

    /// The stream, view, or mapping was already closed.
    #[error("Attempt to use a closed {0}.")]
    Closed(&'static str),

    /// A direct I/O buffer size that cannot be rounded to whole pages within
    /// the allowed maximum.
    #[error("Buffer size {size} is out of range, maximum is {max} bytes.")]
    BufferSizeOutOfRange { size: usize, max: usize },

    /// A configuration setting has a value its type allows but the I/O paths
    /// cannot use.
    #[error("Invalid configuration: `{field}` {reason}.")]
    InvalidConfig { field: &'static str, reason: String },
}

impl From<IoError> for StorageError {
    fn from(value: IoError) -> Self {
        Self::StdIo(value.kind())
    }
}

#[cfg(unix)]
impl From<nix::Error> for StorageError {
    fn from(value: nix::Error) -> Self {
        Self::StdIo(IoError::from(value).kind())
    }
}

impl From<StorageError> for IoError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::StdIo(kind) => kind.into(),
            error => IoError::new(error.kind(), error),
        }
    }
}

fn serialize_io_error<S>(kind: &ErrorKind, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ser = serializer.serialize_struct("IOError", 1)?;
    ser.serialize_field("kind", &kind.to_string())?;
    ser.end()
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StdIo(kind) => *kind,
            StorageError::SliceOffsetPastEnd { .. }
            | StorageError::SliceTooLong { .. }
            | StorageError::SeekPastEof { .. }
            | StorageError::BufferSizeOutOfRange { .. }
            | StorageError::InvalidConfig { .. } => ErrorKind::InvalidInput,
            StorageError::ReadPastEof { .. } => ErrorKind::UnexpectedEof,
            StorageError::Closed(_) => ErrorKind::Other,
        }
    }

    /// Returns true for the out-of-range family: bad slice windows, seeks
    /// past the end and unusable buffer sizes.
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            StorageError::SliceOffsetPastEnd { .. }
                | StorageError::SliceTooLong { .. }
                | StorageError::SeekPastEof { .. }
                | StorageError::BufferSizeOutOfRange { .. }
        )
    }

    /// Returns true if a read ran out of data.
    pub fn is_eof(&self) -> bool {
        self.kind() == ErrorKind::UnexpectedEof
    }
}

/// Collects the outcome of a multi-step teardown.
///
/// Every step runs regardless of earlier failures. The first error is kept
/// for the caller and later ones are only logged.
pub(crate) struct Teardown {
    what: &'static str,
    first: Option<StorageError>,
}

impl Teardown {
    pub(crate) fn new(what: &'static str) -> Self {
        Self { what, first: None }
    }

    pub(crate) fn step<E>(&mut self, step: &'static str, result: Result<(), E>)
    where
        E: Into<StorageError>,
    {
        if let Err(error) = result {
            let error = error.into();
            if self.first.is_none() {
                self.first = Some(error);
            } else {
                tracing::warn!("{}: {step} failed after an earlier error: {error}", self.what);
            }
        }
    }

    pub(crate) fn finish(self) -> Result<(), StorageError> {
        match self.first {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

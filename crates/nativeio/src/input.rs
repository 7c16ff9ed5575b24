//! Read-side contracts shared by every input path.

use crate::error::StorageError;

/// A cursor-based reader over one file or window of a file.
///
/// Multi-byte values are little-endian.
pub trait IndexInput: Send {
    /// Reads one byte at the cursor and advances it.
    fn read_byte(&mut self) -> Result<u8, StorageError>;

    /// Fills `dst` from the cursor and advances it by `dst.len()`.
    ///
    /// Fails with [StorageError::ReadPastEof] unless every byte is available.
    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), StorageError>;

    /// Moves the cursor to `pos`. Seeking to exactly the end is allowed.
    fn seek(&mut self, pos: u64) -> Result<(), StorageError>;

    /// Returns the cursor position.
    fn position(&self) -> u64;

    /// Returns the number of readable bytes.
    fn length(&self) -> Result<u64, StorageError>;

    /// Releases what this input owns. Closing twice is harmless.
    fn close(&mut self) -> Result<(), StorageError>;

    /// Returns an input over the same bytes with its own cursor, starting at
    /// this one's position.
    fn try_clone(&self) -> Result<Self, StorageError>
    where
        Self: Sized;

    fn read_u16(&mut self) -> Result<u16, StorageError> {
        let mut bytes = [0; 2];
        self.read_bytes(&mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_u32(&mut self) -> Result<u32, StorageError> {
        let mut bytes = [0; 4];
        self.read_bytes(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&mut self) -> Result<u64, StorageError> {
        let mut bytes = [0; 8];
        self.read_bytes(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Reads at absolute positions without disturbing the cursor.
pub trait RandomAccessInput {
    fn read_byte_at(&self, pos: u64) -> Result<u8, StorageError>;

    fn read_bytes_at(&self, dst: &mut [u8], pos: u64) -> Result<(), StorageError>;

    fn read_u16_at(&mut self, pos: u64) -> Result<u16, StorageError>;

    fn read_u32_at(&mut self, pos: u64) -> Result<u32, StorageError>;

    fn read_u64_at(&mut self, pos: u64) -> Result<u64, StorageError>;
}

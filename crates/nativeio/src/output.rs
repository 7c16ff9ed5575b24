//! Write-side contract shared by every output path.

use crate::error::StorageError;

/// A sequential writer that checksums what it writes.
pub trait IndexOutput: Send {
    fn write_byte(&mut self, byte: u8) -> Result<(), StorageError>;

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Returns the CRC-32 (IEEE) of every byte written so far.
    fn checksum(&mut self) -> Result<u32, StorageError>;

    /// Returns the number of bytes written so far.
    fn position(&self) -> u64;

    /// Writes out every buffered byte, leaving the file with exactly
    /// [position](Self::position) bytes. Closing twice is harmless.
    fn close(&mut self) -> Result<(), StorageError>;

    fn write_u16(&mut self, value: u16) -> Result<(), StorageError> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_u32(&mut self, value: u32) -> Result<(), StorageError> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<(), StorageError> {
        self.write_bytes(&value.to_le_bytes())
    }
}

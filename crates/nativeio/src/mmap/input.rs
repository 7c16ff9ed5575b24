use std::sync::Arc;

use tracing::warn;

use super::MappedGuard;
use crate::{
    error::StorageError,
    input::{IndexInput, RandomAccessInput},
};

/// A window onto a mapped file with its own cursor.
///
/// The root view, from [new_root](Self::new_root), spans the whole file and
/// holds the guard's reference. [slice](Self::slice) and
/// [try_clone](IndexInput::try_clone) derive views that share the mapping
/// without taking references of their own, so the mapping goes away when the
/// root closes, whatever derived views remain. Those then fail with
/// [StorageError::Closed].
#[derive(Debug)]
pub struct MappedInput {
    guard: Arc<MappedGuard>,

    /// Start of the window within the file.
    offset: u64,
    length: u64,

    /// Cursor, relative to `offset`.
    pos: u64,

    is_root: bool,

    /// Whether this is a root that has not yet released its reference.
    holds_ref: bool,
}

impl MappedInput {
    /// Returns a view of the whole file mapped by `guard`, taking one of its
    /// references.
    pub fn new_root(guard: Arc<MappedGuard>) -> Result<Self, StorageError> {
        guard.open()?;
        let length = guard.length();
        Ok(Self {
            guard,
            offset: 0,
            length,
            pos: 0,
            is_root: true,
            holds_ref: true,
        })
    }

    /// Returns a view of `length` bytes starting `offset` bytes into this one,
    /// with its cursor at 0.
    pub fn slice(&self, offset: u64, length: u64) -> Result<Self, StorageError> {
        if offset >= self.length {
            return Err(StorageError::SliceOffsetPastEnd {
                offset,
                length: self.length,
            });
        }
        if length > self.length - offset {
            return Err(StorageError::SliceTooLong {
                offset,
                slice_length: length,
                length: self.length,
            });
        }
        Ok(self.derive(self.offset + offset, length, 0))
    }

    fn derive(&self, offset: u64, length: u64, pos: u64) -> Self {
        Self {
            guard: self.guard.clone(),
            offset,
            length,
            pos,
            is_root: false,
            holds_ref: false,
        }
    }

    pub fn guard(&self) -> &Arc<MappedGuard> {
        &self.guard
    }

    /// Returns the start of this window within the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    fn past_eof(&self, position: u64, wanted: u64) -> StorageError {
        StorageError::ReadPastEof {
            position,
            wanted,
            length: self.length,
        }
    }

    /// Runs `read` with the cursor at `pos`, then puts the cursor back where
    /// it was, whether or not the read succeeded.
    fn read_at<T>(
        &mut self,
        pos: u64,
        read: impl FnOnce(&mut Self) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let saved = self.pos;
        let result = self.seek(pos).and_then(|()| read(self));
        self.pos = saved;
        result
    }
}

impl RandomAccessInput for MappedInput {
    fn read_byte_at(&self, pos: u64) -> Result<u8, StorageError> {
        if pos >= self.length {
            return Err(self.past_eof(pos, 1));
        }
        self.guard.region().read_byte(self.offset + pos)
    }

    fn read_bytes_at(&self, dst: &mut [u8], pos: u64) -> Result<(), StorageError> {
        if dst.is_empty() {
            return Ok(());
        }
        let wanted = dst.len() as u64;
        if pos >= self.length || self.length - pos < wanted {
            return Err(self.past_eof(pos, wanted));
        }
        self.guard.region().read_bytes(dst, self.offset + pos)
    }

    fn read_u16_at(&mut self, pos: u64) -> Result<u16, StorageError> {
        self.read_at(pos, |input| input.read_u16())
    }

    fn read_u32_at(&mut self, pos: u64) -> Result<u32, StorageError> {
        self.read_at(pos, |input| input.read_u32())
    }

    fn read_u64_at(&mut self, pos: u64) -> Result<u64, StorageError> {
        self.read_at(pos, |input| input.read_u64())
    }
}

impl IndexInput for MappedInput {
    fn read_byte(&mut self) -> Result<u8, StorageError> {
        let byte = self.read_byte_at(self.pos)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), StorageError> {
        self.read_bytes_at(dst, self.pos)?;
        self.pos += dst.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        if pos > self.length {
            return Err(StorageError::SeekPastEof {
                position: pos,
                length: self.length,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> Result<u64, StorageError> {
        Ok(self.length)
    }

    /// Releases the root's reference, unmapping the file. Closing a slice or
    /// a clone, or closing the root again, does nothing.
    fn close(&mut self) -> Result<(), StorageError> {
        if !self.holds_ref {
            return Ok(());
        }
        self.holds_ref = false;
        self.guard.release()
    }

    fn try_clone(&self) -> Result<Self, StorageError> {
        Ok(self.derive(self.offset, self.length, self.pos))
    }
}

impl Drop for MappedInput {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("error releasing mapped input on drop: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        error::StorageError,
        input::{IndexInput, RandomAccessInput},
        test::{init_test_logger, random_bytes, test_dir, write_file},
    };

    use super::{super::MappedRegion, MappedGuard, MappedInput};

    fn root(data: &[u8]) -> (tempfile::TempDir, MappedInput) {
        let dir = test_dir();
        let path = dir.path().join("mapped");
        write_file(&path, data);
        let guard = MappedGuard::new(MappedRegion::map(&path).unwrap());
        (dir, MappedInput::new_root(guard).unwrap())
    }

    #[test]
    fn sequential_and_absolute() {
        init_test_logger();
        let data: Vec<u8> = (0..=255).collect();
        let (_dir, mut input) = root(&data);
        assert!(input.is_root());
        assert_eq!(input.length().unwrap(), 256);

        assert_eq!(input.read_byte().unwrap(), 0);
        let mut dst = [0; 3];
        input.read_bytes(&mut dst).unwrap();
        assert_eq!(dst, [1, 2, 3]);
        assert_eq!(input.position(), 4);

        assert_eq!(input.read_byte_at(200).unwrap(), 200);
        assert_eq!(input.read_u16_at(1).unwrap(), u16::from_le_bytes([1, 2]));
        assert_eq!(
            input.read_u32_at(4).unwrap(),
            u32::from_le_bytes([4, 5, 6, 7])
        );
        assert_eq!(
            input.read_u64_at(248).unwrap(),
            u64::from_le_bytes([248, 249, 250, 251, 252, 253, 254, 255])
        );
        assert_eq!(input.position(), 4);

        // A failed absolute read leaves the cursor alone.
        assert!(input.read_u64_at(250).unwrap_err().is_eof());
        assert!(input.read_u16_at(300).unwrap_err().is_out_of_range());
        assert_eq!(input.position(), 4);
    }

    #[test]
    fn bounds() {
        init_test_logger();
        let (_dir, mut input) = root(&[9; 10]);
        input.seek(10).unwrap();
        assert!(input.read_byte().unwrap_err().is_eof());
        input.read_bytes(&mut []).unwrap();
        assert_eq!(
            input.seek(11),
            Err(StorageError::SeekPastEof {
                position: 11,
                length: 10
            })
        );
        assert_eq!(
            input.read_bytes_at(&mut [0; 4], 8),
            Err(StorageError::ReadPastEof {
                position: 8,
                wanted: 4,
                length: 10
            })
        );
        input.read_bytes_at(&mut [], 10).unwrap();
        assert!(input.read_byte_at(10).unwrap_err().is_eof());
    }

    #[test]
    fn slices() {
        init_test_logger();
        let data: Vec<u8> = (0..100).collect();
        let (_dir, root) = root(&data);
        let length = root.length().unwrap();

        assert_eq!(
            root.slice(length, 0).unwrap_err(),
            StorageError::SliceOffsetPastEnd {
                offset: 100,
                length: 100
            }
        );
        assert_eq!(
            root.slice(150, 1).unwrap_err(),
            StorageError::SliceOffsetPastEnd {
                offset: 150,
                length: 100
            }
        );
        assert_eq!(
            root.slice(10, 91).unwrap_err(),
            StorageError::SliceTooLong {
                offset: 10,
                slice_length: 91,
                length: 100
            }
        );
        let mut last = root.slice(length - 1, 1).unwrap();
        assert_eq!(last.read_byte().unwrap(), 99);

        let mut slice = root.slice(10, 50).unwrap();
        assert!(!slice.is_root());
        assert_eq!(slice.offset(), 10);
        assert_eq!(slice.position(), 0);
        assert_eq!(slice.read_byte().unwrap(), 10);

        let mut nested = slice.slice(5, 10).unwrap();
        assert_eq!(nested.offset(), 15);
        assert_eq!(nested.read_byte().unwrap(), 15);
        assert_eq!(nested.read_byte_at(9).unwrap(), 24);
        assert!(nested.read_byte_at(10).unwrap_err().is_eof());
        nested.seek(10).unwrap();
        assert!(nested.read_byte().unwrap_err().is_eof());

        // Slices take no reference.
        assert_eq!(root.guard().ref_count(), 1);
    }

    #[test]
    fn clones() {
        init_test_logger();
        let data: Vec<u8> = (0..100).collect();
        let (_dir, mut root) = root(&data);
        root.seek(20).unwrap();
        let mut clone = root.try_clone().unwrap();
        assert!(!clone.is_root());
        assert_eq!(clone.position(), 20);
        assert_eq!(clone.read_byte().unwrap(), 20);
        assert_eq!(root.position(), 20);
        assert_eq!(root.read_byte().unwrap(), 20);
        assert_eq!(root.read_byte().unwrap(), 21);
        assert_eq!(clone.position(), 21);
        assert_eq!(root.guard().ref_count(), 1);
    }

    #[test]
    fn root_close_unmaps() {
        init_test_logger();
        let (_dir, mut root) = root(&random_bytes(4096));
        let guard = root.guard().clone();
        let mut views = vec![root.try_clone().unwrap(), root.slice(0, 10).unwrap()];
        views.push(views[1].slice(1, 2).unwrap());
        views.push(views[2].try_clone().unwrap());

        // Closing derived views changes nothing.
        for view in &mut views {
            view.close().unwrap();
            view.close().unwrap();
        }
        assert_eq!(guard.ref_count(), 1);
        assert!(!guard.is_closed());
        views[0].read_byte().unwrap();

        root.close().unwrap();
        assert!(guard.is_closed());
        assert_eq!(guard.ref_count(), 0);
        for view in &mut views {
            assert_eq!(view.read_byte(), Err(StorageError::Closed("mapped region")));
        }
        assert_eq!(root.read_byte(), Err(StorageError::Closed("mapped region")));

        // A second root close does not release again.
        root.close().unwrap();
        assert_eq!(guard.ref_count(), 0);
    }

    #[test]
    fn drop_releases() {
        init_test_logger();
        let (_dir, root) = root(b"dropped");
        let guard = root.guard().clone();
        let slice = root.slice(1, 3).unwrap();
        drop(slice);
        assert!(!guard.is_closed());
        drop(root);
        assert!(guard.is_closed());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn slice_bounds(len in 1u64..200, offset in 0u64..300, length in 0u64..300) {
            let data = random_bytes(len as usize);
            let (_dir, root) = root(&data);
            match root.slice(offset, length) {
                Ok(mut slice) => {
                    prop_assert!(offset < len && offset + length <= len);
                    let mut dst = vec![0; length as usize];
                    slice.read_bytes(&mut dst).unwrap();
                    prop_assert_eq!(&dst[..], &data[offset as usize..(offset + length) as usize]);
                }
                Err(StorageError::SliceOffsetPastEnd { .. }) => prop_assert!(offset >= len),
                Err(StorageError::SliceTooLong { .. }) => {
                    prop_assert!(offset < len && offset + length > len)
                }
                Err(error) => prop_assert!(false, "unexpected error {error}"),
            }
        }
    }
}

//! Page-aligned buffers for direct I/O.

use std::{
    alloc::{self, Layout},
    fmt,
    fs::File,
    io::{self, ErrorKind},
    ptr::NonNull,
    slice,
};

use crate::{page_size, round_up_to_page};

/// A fixed-capacity block of memory for direct I/O.
///
/// # Invariants
/// - The start address and the capacity are multiples of the page size, which
///   satisfies the alignment that `O_DIRECT` requires of buffers, offsets and
///   lengths.
/// - The memory is owned by exactly one `AlignedBuf` and freed when it is
///   dropped or passed to [free](Self::free).
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    cap: usize,
}

// SAFETY: `AlignedBuf` uniquely owns its allocation, like a `Box<[u8]>`.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl Drop for AlignedBuf {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated in `with_capacity` with this layout.
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout());
        }
    }
}

impl AlignedBuf {
    /// Allocates a zeroed buffer of at least `min_capacity` bytes, rounded up
    /// to the page size. A request for 0 bytes still allocates one page.
    ///
    /// Allocation failure aborts through [alloc::handle_alloc_error].
    pub fn with_capacity(min_capacity: usize) -> Self {
        let cap = round_up_to_page(min_capacity)
            .filter(|&cap| cap <= isize::MAX as usize - (page_size() - 1))
            .unwrap_or_else(|| panic!("`capacity` cannot exceed isize::MAX minus one page"));
        let ptr = unsafe {
            let layout = Layout::from_size_align_unchecked(cap, page_size());
            let ptr = alloc::alloc_zeroed(layout);
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            NonNull::new_unchecked(ptr)
        };
        Self { ptr, cap }
    }

    #[inline]
    fn layout(&self) -> Layout {
        unsafe { Layout::from_size_align_unchecked(self.cap, page_size()) }
    }

    /// Returns the number of bytes in the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Returns a pointer to the start of the buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.cap) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }

    /// Releases the buffer. Equivalent to dropping it.
    pub fn free(self) {
        drop(self)
    }

    /// Fills the buffer from `file` starting at `offset`, with a single
    /// positioned read, and returns the number of bytes read. The count is
    /// less than the capacity only at end of file.
    ///
    /// Interrupted reads are retried.
    #[cfg(unix)]
    pub fn read_from(&mut self, file: &File, offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        loop {
            match file.read_at(self.as_mut_slice(), offset) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    /// Writes the whole buffer to `file` at `offset`.
    #[cfg(unix)]
    pub fn write_to(&self, file: &File, offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;

        file.write_all_at(self.as_slice(), offset)
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.ptr)
            .field("cap", &self.cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileExt;

    use crate::page_size;

    use super::AlignedBuf;

    #[test]
    fn alignment_and_capacity() {
        let page = page_size();
        for request in [0, 1, page - 1, page, page + 1, 3 * page + 7] {
            let buf = AlignedBuf::with_capacity(request);
            assert_eq!(buf.as_ptr() as usize % page, 0);
            assert_eq!(buf.capacity() % page, 0);
            assert!(buf.capacity() >= request.max(1));
            assert!(buf.capacity() < request.max(1) + page);
            assert!(buf.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    #[should_panic(expected = "cannot exceed isize::MAX")]
    fn capacity_overflow() {
        AlignedBuf::with_capacity(usize::MAX);
    }

    #[test]
    fn read_and_write() {
        let page = page_size();
        let file = tempfile::tempfile().unwrap();
        let mut buf = AlignedBuf::with_capacity(page);
        buf.as_mut_slice().fill(0xab);
        buf.write_to(&file, page as u64).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 2 * page as u64);

        // The first page is a hole of zeros.
        let mut other = AlignedBuf::with_capacity(2 * page);
        assert_eq!(other.read_from(&file, 0).unwrap(), 2 * page);
        assert!(other.as_slice()[..page].iter().all(|&b| b == 0));
        assert!(other.as_slice()[page..].iter().all(|&b| b == 0xab));

        // Short read at end of file.
        file.write_all_at(b"xyz", 2 * page as u64).unwrap();
        assert_eq!(other.read_from(&file, 2 * page as u64).unwrap(), 3);
        assert_eq!(&other.as_slice()[..3], b"xyz");
        other.free();
    }
}

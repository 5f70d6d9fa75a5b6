use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::slice;

use crate::error::{MigrationError, Result};

/// Fixed-capacity, aligned byte buffer with a write cursor.
///
/// All access goes through the raw base pointer so that regions already handed out
/// as scatter/gather entries stay valid while later bytes are appended.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(capacity: usize, alignment: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(MigrationError::InvalidConfig("buffer capacity must be > 0"));
        }
        let layout = Layout::from_size_align(capacity, alignment)
            .map_err(|_| MigrationError::InvalidConfig("invalid buffer layout"))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Ok(Self { ptr, layout, len: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Pointer to the first unused byte.
    pub(crate) fn cursor_ptr(&self) -> *const u8 {
        // SAFETY: len <= capacity, so this is at most one past the end.
        unsafe { self.ptr.as_ptr().add(self.len) }
    }

    /// The filled part of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the first `len` bytes are initialized (the allocation is zeroed).
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Whole allocation, regardless of the cursor. Used by the read path, which
    /// manages its own window.
    pub(crate) fn as_full_mut(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is zero-initialized and exclusively borrowed.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity()) }
    }

    pub(crate) fn as_full(&self) -> &[u8] {
        // SAFETY: see `as_full_mut`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.capacity()) }
    }

    /// The unused tail of the buffer.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        let remaining = self.remaining();
        // SAFETY: the tail does not overlap the filled prefix.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.len), remaining) }
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        // SAFETY: `n` bytes fit after the cursor and `data` cannot alias our allocation
        // through a shared borrow while `self` is borrowed mutably.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(self.len), n);
        }
        self.len += n;
        n
    }

    pub(crate) fn advance(&mut self, n: usize) {
        assert!(
            n <= self.remaining(),
            "advance past end of buffer ({n} > {})",
            self.remaining()
        );
        self.len += n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("capacity", &self.capacity())
            .field("alignment", &self.alignment())
            .field("len", &self.len)
            .finish()
    }
}

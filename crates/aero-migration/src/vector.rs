use std::io::IoSlice;
use std::marker::PhantomData;
use std::slice;

/// One scatter/gather region, plus whether its pages may be dropped after it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEntry {
    ptr: *const u8,
    len: usize,
    reclaim: bool,
}

impl IoEntry {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reclaimable(&self) -> bool {
        self.reclaim
    }

    fn end(&self) -> usize {
        self.ptr as usize + self.len
    }
}

/// Address range that may be handed to the OS as no longer needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimRange {
    pub addr: usize,
    pub len: usize,
}

/// Capped scatter/gather list used by vectored (synchronous) streams.
///
/// Entries borrow memory for `'a`; the stream's internal scratch buffer outlives the
/// accumulator, and caller-provided regions are tied to `'a` by the `push_*` methods.
pub struct IoVector<'a> {
    entries: Vec<IoEntry>,
    cap: usize,
    _borrow: PhantomData<&'a [u8]>,
}

// SAFETY: entries behave like `&'a [u8]` / `&'a mut [u8]`, both of which are `Send`.
unsafe impl Send for IoVector<'_> {}

impl<'a> IoVector<'a> {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "iovec capacity must be > 0");
        Self {
            entries: Vec::with_capacity(cap),
            cap,
            _borrow: PhantomData,
        }
    }

    /// Queues a region that must not be reclaimed. Returns `true` once the list is full.
    pub fn push_slice(&mut self, data: &'a [u8]) -> bool {
        // SAFETY: `data` is borrowed for `'a`.
        unsafe { self.push_raw(data.as_ptr(), data.len(), false) }
    }

    /// Queues a region whose pages may be discarded after a successful flush.
    pub fn push_reclaimable(&mut self, data: &'a mut [u8]) -> bool {
        // SAFETY: `data` is exclusively borrowed for `'a`, so discarding its pages
        // later cannot be observed through another reference.
        unsafe { self.push_raw(data.as_ptr(), data.len(), true) }
    }

    /// Appends `(ptr, len)`, extending the previous entry when it ends exactly at `ptr`
    /// and carries the same reclaim flag.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay readable until the list is cleared, and must be
    /// exclusively owned by the caller if `reclaim` is set.
    pub(crate) unsafe fn push_raw(&mut self, ptr: *const u8, len: usize, reclaim: bool) -> bool {
        if len == 0 {
            return self.is_full();
        }
        match self.entries.last_mut() {
            Some(last) if last.end() == ptr as usize && last.reclaim == reclaim => {
                last.len += len;
            }
            _ => self.entries.push(IoEntry { ptr, len, reclaim }),
        }
        self.is_full()
    }

    pub fn entries(&self) -> &[IoEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.cap
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Sum of all entry lengths.
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|e| e.len).sum()
    }

    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.entries
            .iter()
            // SAFETY: guaranteed readable by the `push_*` contracts.
            .map(|e| IoSlice::new(unsafe { slice::from_raw_parts(e.ptr, e.len) }))
            .collect()
    }

    /// Merged address ranges of all reclaim-eligible entries, in list order.
    ///
    /// Only eligible entries contribute; two eligible entries merge when the first ends
    /// where the second starts, even if ineligible entries sit between them in the list.
    pub fn reclaim_ranges(&self) -> Vec<ReclaimRange> {
        let mut ranges: Vec<ReclaimRange> = Vec::new();
        for entry in self.entries.iter().filter(|e| e.reclaim) {
            let addr = entry.ptr as usize;
            match ranges.last_mut() {
                Some(last) if last.addr + last.len == addr => last.len += entry.len,
                _ => ranges.push(ReclaimRange {
                    addr,
                    len: entry.len,
                }),
            }
        }
        ranges
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

use std::io;

use crate::vector::ReclaimRange;

/// Best-effort "these pages are no longer needed" hint.
///
/// Hints are purely a memory optimisation; ignoring them never affects correctness.
/// A stream only issues them for ranges the caller explicitly marked reclaimable.
pub trait PageReclaimer: Send + Sync {
    fn discard(&self, range: ReclaimRange) -> io::Result<()>;
}

/// Uses `madvise(MADV_DONTNEED)` on unix and does nothing elsewhere.
///
/// Only whole pages inside the range are advised; partial pages at either end are left
/// alone so neighbouring data is never dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsReclaimer;

impl OsReclaimer {
    #[cfg(unix)]
    fn page_size() -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }
}

impl PageReclaimer for OsReclaimer {
    #[cfg(unix)]
    fn discard(&self, range: ReclaimRange) -> io::Result<()> {
        let page = Self::page_size();
        let start = range.addr.div_ceil(page) * page;
        let end = (range.addr + range.len) / page * page;
        if end <= start {
            return Ok(());
        }
        // SAFETY: `start..end` lies within memory the caller handed over as
        // exclusively borrowed and reclaimable.
        let rc = unsafe {
            libc::madvise(
                start as *mut libc::c_void,
                end - start,
                libc::MADV_DONTNEED,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn discard(&self, _range: ReclaimRange) -> io::Result<()> {
        Ok(())
    }
}

/// Issues one hint per range, logging failures.
pub(crate) fn discard_ranges(reclaimer: &dyn PageReclaimer, ranges: &[ReclaimRange]) {
    for &range in ranges {
        if let Err(err) = reclaimer.discard(range) {
            tracing::warn!(
                addr = range.addr,
                len = range.len,
                error = %err,
                "discarding migrated pages failed"
            );
        }
    }
}

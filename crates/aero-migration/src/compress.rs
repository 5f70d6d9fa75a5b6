use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{MigrationError, Result};

/// Size of the big-endian length prefix written in front of every compressed chunk.
pub const CHUNK_PREFIX_LEN: usize = 4;

/// Worst-case deflate output size for `len` input bytes (zlib's `compressBound`).
pub fn compress_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

/// Reusable raw-deflate context. Every call starts from a reset state, so chunks are
/// independent and can be inflated one at a time.
pub struct Compressor {
    inner: Compress,
}

impl Compressor {
    pub fn new(level: u32) -> Self {
        Self {
            inner: Compress::new(Compression::new(level), false),
        }
    }

    /// Compresses `src` into `dest` and returns the compressed length.
    ///
    /// Fails with [`MigrationError::WouldNotFit`] (recoverable) when `dest` is smaller
    /// than [`compress_bound`]`(src.len())`. Does not write the length prefix.
    pub fn compress(&mut self, dest: &mut [u8], src: &[u8]) -> Result<usize> {
        let needed = compress_bound(src.len());
        if dest.len() < needed {
            return Err(MigrationError::WouldNotFit {
                needed,
                available: dest.len(),
            });
        }

        self.inner.reset();
        let status = self
            .inner
            .compress(src, dest, FlushCompress::Finish)
            .map_err(|err| MigrationError::Compression(err.to_string()))?;
        match status {
            Status::StreamEnd => Ok(self.inner.total_out() as usize),
            Status::Ok | Status::BufError => Err(MigrationError::Compression(
                "deflate did not finish within the bound".into(),
            )),
        }
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor").finish_non_exhaustive()
    }
}

/// Inverse of [`Compressor`].
pub struct Decompressor {
    inner: Decompress,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    /// Inflates one complete chunk into `dest`, returning the decompressed length.
    pub fn decompress(&mut self, dest: &mut [u8], src: &[u8]) -> Result<usize> {
        self.inner.reset(false);
        let status = self
            .inner
            .decompress(src, dest, FlushDecompress::Finish)
            .map_err(|err| MigrationError::Compression(err.to_string()))?;
        match status {
            Status::StreamEnd => Ok(self.inner.total_out() as usize),
            Status::Ok | Status::BufError => Err(MigrationError::Compression(
                "compressed chunk is truncated or larger than the destination".into(),
            )),
        }
    }
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor").finish_non_exhaustive()
    }
}

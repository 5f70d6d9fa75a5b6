use crate::error::{MigrationError, Result};

pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024; // 1MiB
pub const DEFAULT_BUFFER_COUNT: usize = 2;
pub const DEFAULT_BUFFER_ALIGNMENT: usize = 512;
pub const DEFAULT_MAX_IOV: usize = 64;

/// Upper bound for `max_iov`; matches the common platform `IOV_MAX`.
pub const MAX_IOV_LIMIT: usize = 1024;

const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Sizing for a single migration stream, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Capacity of every I/O buffer (pool buffers and the scratch/read buffer).
    pub buffer_size: usize,
    /// Number of pool buffers, and therefore the number of writes that may be in
    /// flight at once, in buffered mode.
    pub buffer_count: usize,
    pub alignment: usize,
    /// Scatter/gather entries accumulated before a vectored flush is forced.
    pub max_iov: usize,
    /// Deflate level for `put_compressed`. `None` disables compression.
    pub compression: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
            alignment: DEFAULT_BUFFER_ALIGNMENT,
            max_iov: DEFAULT_MAX_IOV,
            compression: None,
        }
    }
}

impl StreamConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_max_iov(mut self, max_iov: usize) -> Self {
        self.max_iov = max_iov;
        self
    }

    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression = Some(level);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(MigrationError::InvalidConfig("buffer_size must be > 0"));
        }
        if self.buffer_size > i32::MAX as usize {
            return Err(MigrationError::InvalidConfig(
                "buffer_size must fit in a signed 32-bit length",
            ));
        }
        if self.buffer_count == 0 {
            return Err(MigrationError::InvalidConfig("buffer_count must be > 0"));
        }
        if !self.alignment.is_power_of_two() {
            return Err(MigrationError::InvalidConfig(
                "alignment must be a power of two",
            ));
        }
        if self.buffer_size % self.alignment != 0 {
            return Err(MigrationError::InvalidConfig(
                "buffer_size must be a multiple of alignment",
            ));
        }
        if self.max_iov == 0 || self.max_iov > MAX_IOV_LIMIT {
            return Err(MigrationError::InvalidConfig(
                "max_iov must be within 1..=1024",
            ));
        }
        if matches!(self.compression, Some(level) if level > MAX_COMPRESSION_LEVEL) {
            return Err(MigrationError::InvalidConfig(
                "compression level must be within 0..=9",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        StreamConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_geometry() {
        let cases = [
            StreamConfig::default().with_buffer_size(0),
            StreamConfig::default().with_buffer_count(0),
            StreamConfig::default().with_alignment(3),
            StreamConfig::default().with_buffer_size(1000),
            StreamConfig::default().with_max_iov(0),
            StreamConfig::default().with_max_iov(MAX_IOV_LIMIT + 1),
            StreamConfig::default().with_compression(10),
        ];
        for cfg in cases {
            let err = cfg.validate().unwrap_err();
            assert!(matches!(err, MigrationError::InvalidConfig(_)), "{cfg:?}");
        }
    }

    #[test]
    fn small_buffers_for_tests_are_accepted() {
        StreamConfig::default()
            .with_buffer_size(64)
            .with_alignment(8)
            .with_max_iov(4)
            .with_compression(6)
            .validate()
            .unwrap();
    }
}

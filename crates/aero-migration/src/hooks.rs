use crate::error::MigrationError;

/// RAM control flags passed to the iteration and load hooks.
pub const RAM_CONTROL_SETUP: u64 = 0;
pub const RAM_CONTROL_ROUND: u64 = 1;
/// The source explicitly expects a load hook on the destination.
pub const RAM_CONTROL_HOOK: u64 = 2;
pub const RAM_CONTROL_FINISH: u64 = 3;
pub const RAM_CONTROL_BLOCK_REG: u64 = 4;

/// Result of offering a page to a fast-path save hook.
#[derive(Debug, Clone)]
pub enum SavePageOutcome {
    /// The hook does not handle pages; the caller sends the page through the stream.
    NotSupported,
    /// The hook took the page but will report the bytes later.
    Delayed,
    /// The hook sent the page itself.
    Sent { bytes: u64 },
    Failed(MigrationError),
}

/// Callbacks a transport-specific accelerator (e.g. RDMA) can install on a stream.
///
/// Every method has a default, so implementors only override the hooks they need.
pub trait MigrationHooks: Send {
    fn before_iterate(&mut self, _flags: u64) -> Result<(), MigrationError> {
        Ok(())
    }

    fn after_iterate(&mut self, _flags: u64) -> Result<(), MigrationError> {
        Ok(())
    }

    /// Out-of-band data on the receiving side. `None` means no load hook is provided.
    fn load(&mut self, _flags: u64, _data: &[u8]) -> Option<Result<(), MigrationError>> {
        None
    }

    fn save_page(&mut self, _block_offset: u64, _offset: u64, _size: usize) -> SavePageOutcome {
        SavePageOutcome::NotSupported
    }
}

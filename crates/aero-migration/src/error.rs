use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

/// Errors produced by the migration stream layer.
///
/// The type is `Clone` so the first failure of a stream (its sticky error) can be
/// handed out repeatedly from [`crate::MigrationStream::last_error`] and from
/// `close()`. Transport failures therefore keep the native `io::Error` behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    #[error("short write: transport accepted {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("compressed chunk does not fit (need {needed} bytes, {available} available)")]
    WouldNotFit { needed: usize, available: usize },

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("stream has been shut down")]
    Shutdown,

    #[error("operation requires a {expected} stream")]
    WrongDirection { expected: &'static str },

    #[error("{op} is not supported in {mode} mode")]
    UnsupportedMode {
        mode: &'static str,
        op: &'static str,
    },

    #[error("invalid stream configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("counted string is {len} bytes (max 255)")]
    StringTooLong { len: usize },

    #[error("migration hook failed: {0}")]
    Hook(String),

    #[error("peer requested a load hook but none is registered")]
    MissingLoadHook,

    #[error("write executor has shut down")]
    ExecutorGone,
}

impl From<io::Error> for MigrationError {
    fn from(value: io::Error) -> Self {
        Self::Transport(Arc::new(value))
    }
}

impl MigrationError {
    /// `WouldNotFit` is the only condition a caller is expected to retry (after a
    /// flush); everything else is fatal for the stream that produced it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::WouldNotFit { .. })
    }
}

/// First-error-wins slot shared between a stream handle and its write workers.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot {
    first: Mutex<Option<MigrationError>>,
}

impl ErrorSlot {
    /// Records `err` if no error has been recorded yet. Returns whether it was kept.
    pub(crate) fn set(&self, err: MigrationError) -> bool {
        let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            tracing::debug!(error = %err, "migration stream failed");
            *first = Some(err);
            true
        } else {
            tracing::warn!(error = %err, "discarding error on already failed migration stream");
            false
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn get(&self) -> Option<MigrationError> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

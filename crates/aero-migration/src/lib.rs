//! Byte stream used to save and restore VM state during live migration and snapshots.
//!
//! Device and RAM savers produce a long sequence of small and large writes. This crate
//! turns them into efficient transport I/O and exposes the receiving side as a
//! peekable, buffered reader:
//!
//! - [`MigrationStream`]: the stream handle (open, put/get, flush, close)
//! - [`BufferPool`] / [`WriteExecutor`]: fixed pool of aligned buffers written by
//!   background workers, so the producer only blocks on real backpressure
//! - [`IoVector`]: scatter/gather accumulator with optional page reclaim hints
//! - [`Compressor`] / [`Decompressor`]: independent, length-prefixed deflate chunks
//! - [`MigrationHooks`]: optional fast-path callbacks for accelerated transports
//!
//! The first failure is sticky: it is kept, later operations become no-ops, and
//! `close()` reports it.

mod buffer;
mod compress;
mod config;
mod error;
mod hooks;
mod io;
mod pool;
mod reclaim;
mod stream;
mod transport;
mod vector;

pub use buffer::AlignedBuffer;
pub use compress::{compress_bound, Compressor, Decompressor, CHUNK_PREFIX_LEN};
pub use config::{
    StreamConfig, DEFAULT_BUFFER_ALIGNMENT, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE,
    DEFAULT_MAX_IOV, MAX_IOV_LIMIT,
};
pub use error::{MigrationError, Result};
pub use hooks::{
    MigrationHooks, SavePageOutcome, RAM_CONTROL_BLOCK_REG, RAM_CONTROL_FINISH,
    RAM_CONTROL_HOOK, RAM_CONTROL_ROUND, RAM_CONTROL_SETUP,
};
pub use pool::{BufferPool, WriteExecutor, WriteTicket};
pub use reclaim::{OsReclaimer, PageReclaimer};
pub use stream::{MigrationStream, StreamMode};
#[cfg(unix)]
pub use transport::FileTransport;
pub use transport::{Direction, IoTransport, MemTransport, Transport};
pub use vector::{IoEntry, IoVector, ReclaimRange};

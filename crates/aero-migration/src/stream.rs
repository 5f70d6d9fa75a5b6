//! The migration stream handle.
//!
//! A stream is opened over a [`Transport`] in one [`Direction`]. Writers pick one of two
//! strategies from the transport's capability flag, once, at open time:
//!
//! - **Buffered**: bytes are copied into pool buffers; full buffers are written by
//!   background workers. The producer only blocks when every buffer is in flight.
//! - **Vectored**: small writes are staged in a scratch buffer, large caller regions are
//!   referenced in place, and everything goes out as one vectored write per flush on
//!   the caller's thread.
//!
//! The first failure becomes the stream's sticky error. After that, write and read
//! calls do nothing (reads return zero bytes) and `close()` reports that first error.

use std::sync::Arc;

use crate::buffer::AlignedBuffer;
use crate::compress::{compress_bound, Compressor, Decompressor, CHUNK_PREFIX_LEN};
use crate::config::StreamConfig;
use crate::error::{ErrorSlot, MigrationError, Result};
use crate::hooks::{MigrationHooks, SavePageOutcome, RAM_CONTROL_HOOK};
use crate::pool::{BufferPool, WriteExecutor};
use crate::reclaim::{discard_ranges, OsReclaimer, PageReclaimer};
use crate::transport::{Direction, Transport};
use crate::vector::{IoEntry, IoVector, ReclaimRange};

/// Strategy selected for a stream at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Buffered,
    Vectored,
    Read,
}

impl StreamMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamMode::Buffered => "buffered",
            StreamMode::Vectored => "vectored",
            StreamMode::Read => "read",
        }
    }
}

/// State every backend needs while moving bytes.
struct Core {
    transport: Arc<dyn Transport>,
    errors: Arc<ErrorSlot>,
    reclaimer: Arc<dyn PageReclaimer>,
    /// Writers: bytes handed irrevocably to the transport or to an in-flight task.
    /// Readers: bytes pulled from the transport.
    flushed: u64,
    /// Bytes accepted since the last rate-limit reset.
    transferred: u64,
    shutdown: bool,
}

impl Core {
    fn fail(&self, err: MigrationError) {
        self.errors.set(err);
    }

    fn failed(&self) -> bool {
        self.errors.is_set()
    }
}

enum Backend<'a> {
    Buffered(BufferedWriter),
    Vectored(VectoredWriter<'a>),
    Reader(ReadBuffer),
}

impl Backend<'_> {
    fn mode(&self) -> StreamMode {
        match self {
            Backend::Buffered(_) => StreamMode::Buffered,
            Backend::Vectored(_) => StreamMode::Vectored,
            Backend::Reader(_) => StreamMode::Read,
        }
    }
}

struct BufferedWriter {
    /// `None` only transiently inside `submit_current` and after close.
    current: Option<AlignedBuffer>,
    executor: WriteExecutor,
}

impl BufferedWriter {
    fn unflushed(&self) -> usize {
        self.current.as_ref().map_or(0, AlignedBuffer::len)
    }

    fn put(&mut self, mut data: &[u8], core: &mut Core) {
        while !data.is_empty() {
            if self.current.as_ref().map_or(true, AlignedBuffer::is_full) {
                self.submit_current(core, true);
                if core.failed() {
                    return;
                }
            }
            let Some(buf) = self.current.as_mut() else {
                return;
            };
            let n = buf.extend_from_slice(data);
            data = &data[n..];
            core.transferred += n as u64;
        }
    }

    /// Hands the current buffer to the executor. The logical offset advances now, at
    /// submission, not when the write completes.
    fn submit_current(&mut self, core: &mut Core, reacquire: bool) {
        let pool = Arc::clone(self.executor.pool());
        match self.current.take() {
            Some(buf) if !buf.is_empty() => {
                let offset = core.flushed;
                core.flushed += buf.len() as u64;
                if let Err(err) = self.executor.submit_flush(buf, offset) {
                    core.fail(err);
                }
            }
            Some(buf) => pool.release(buf),
            None => {}
        }
        if reacquire {
            self.current = Some(pool.acquire_current());
        }
    }

    fn pool(&self) -> &BufferPool {
        self.executor.pool()
    }
}

struct VectoredWriter<'a> {
    scratch: AlignedBuffer,
    iov: IoVector<'a>,
    compressor: Option<Compressor>,
}

impl<'a> VectoredWriter<'a> {
    fn new(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            scratch: AlignedBuffer::new(config.buffer_size, config.alignment)?,
            iov: IoVector::new(config.max_iov),
            compressor: config.compression.map(Compressor::new),
        })
    }

    fn unflushed(&self) -> usize {
        self.iov.total_len()
    }

    /// Stages a run of scratch bytes that was just appended at `start`.
    fn queue_scratch(&mut self, start: *const u8, len: usize, core: &mut Core) {
        // SAFETY: the scratch buffer is only reset together with the iovec, and lives
        // as long as this writer.
        let full = unsafe { self.iov.push_raw(start, len, false) };
        if full || self.scratch.is_full() {
            self.flush(core);
        }
    }

    fn put(&mut self, mut data: &[u8], core: &mut Core) {
        while !data.is_empty() {
            if self.scratch.is_full() {
                self.flush(core);
            }
            if core.failed() {
                return;
            }
            let start = self.scratch.cursor_ptr();
            let n = self.scratch.extend_from_slice(data);
            data = &data[n..];
            core.transferred += n as u64;
            self.queue_scratch(start, n, core);
        }
    }

    fn put_borrowed(&mut self, data: &'a [u8], core: &mut Core) {
        core.transferred += data.len() as u64;
        if self.iov.push_slice(data) {
            self.flush(core);
        }
    }

    fn put_reclaimable(&mut self, data: &'a mut [u8], core: &mut Core) {
        core.transferred += data.len() as u64;
        if self.iov.push_reclaimable(data) {
            self.flush(core);
        }
    }

    fn put_compressed(&mut self, src: &[u8], core: &mut Core) -> Result<usize> {
        if self.compressor.is_none() {
            return Err(MigrationError::InvalidConfig(
                "stream was opened without compression",
            ));
        }
        let needed = CHUNK_PREFIX_LEN + compress_bound(src.len());
        if self.scratch.remaining() < needed {
            self.flush(core);
            if let Some(err) = core.errors.get() {
                return Err(err);
            }
        }
        if self.scratch.remaining() < needed {
            return Err(MigrationError::WouldNotFit {
                needed,
                available: self.scratch.remaining(),
            });
        }

        let Some(compressor) = self.compressor.as_mut() else {
            return Err(MigrationError::InvalidConfig(
                "stream was opened without compression",
            ));
        };
        let spare = self.scratch.spare_mut();
        let (prefix, payload) = spare.split_at_mut(CHUNK_PREFIX_LEN);
        let len = match compressor.compress(payload, src) {
            Ok(len) => len,
            Err(err) => {
                if !err.is_recoverable() {
                    core.fail(err.clone());
                }
                return Err(err);
            }
        };
        // Bounded by buffer_size, which `StreamConfig::validate` keeps below i32::MAX.
        prefix.copy_from_slice(&(len as u32).to_be_bytes());

        let start = self.scratch.cursor_ptr();
        let total = CHUNK_PREFIX_LEN + len;
        self.scratch.advance(total);
        core.transferred += total as u64;
        self.queue_scratch(start, total, core);
        Ok(total)
    }

    /// One vectored write of everything queued. Short writes are fatal, not retried.
    fn flush(&mut self, core: &mut Core) {
        if self.iov.is_empty() {
            self.scratch.clear();
            return;
        }
        if core.shutdown || core.failed() {
            return;
        }

        let expected = self.iov.total_len();
        let result = {
            let slices = self.iov.io_slices();
            core.transport.write_vectored_at(&slices, core.flushed)
        };
        match result {
            Ok(written) => {
                core.flushed += written as u64;
                if written == expected {
                    discard_ranges(&*core.reclaimer, &self.iov.reclaim_ranges());
                } else {
                    core.fail(MigrationError::ShortWrite { expected, written });
                }
            }
            Err(err) => core.fail(err.into()),
        }
        tracing::trace!(
            entries = self.iov.len(),
            bytes = expected,
            "flushed vectored migration write"
        );
        self.iov.clear();
        self.scratch.clear();
    }

    /// Hands every queued region to `sink` in stream order, borrowed ones included,
    /// then resets this writer. Returns the number of bytes handed over.
    fn drain_into(&mut self, mut sink: impl FnMut(&[u8])) -> usize {
        let len = self.iov.total_len();
        for slice in self.iov.io_slices() {
            sink(&slice);
        }
        self.iov.clear();
        self.scratch.clear();
        len
    }
}

struct ReadBuffer {
    buf: AlignedBuffer,
    /// Next unread byte.
    index: usize,
    /// End of valid data.
    size: usize,
    decompressor: Option<Decompressor>,
}

impl ReadBuffer {
    fn new(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            buf: AlignedBuffer::new(config.buffer_size, config.alignment)?,
            index: 0,
            size: 0,
            decompressor: None,
        })
    }

    fn pending(&self) -> usize {
        self.size - self.index
    }

    /// Compacts unread bytes to the front and reads once from the transport.
    /// Returns the number of new bytes; 0 on end of stream, error or shutdown.
    fn fill(&mut self, core: &mut Core) -> usize {
        let pending = self.pending();
        if pending > 0 && self.index > 0 {
            let (index, size) = (self.index, self.size);
            self.buf.as_full_mut().copy_within(index..size, 0);
        }
        self.index = 0;
        self.size = pending;

        if core.shutdown || core.failed() || pending == self.buf.capacity() {
            return 0;
        }
        loop {
            match core
                .transport
                .read(&mut self.buf.as_full_mut()[pending..], core.flushed)
            {
                Ok(n) => {
                    self.size += n;
                    core.flushed += n as u64;
                    return n;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return 0,
                Err(err) => {
                    core.fail(err.into());
                    return 0;
                }
            }
        }
    }

    /// Makes up to `n` bytes starting `offset` bytes past the cursor resident, without
    /// consuming them. Single short reads are not mistaken for completion.
    fn peek(&mut self, n: usize, offset: usize, core: &mut Core) -> &[u8] {
        let cap = self.buf.capacity();
        if offset >= cap {
            return &[];
        }
        let n = n.min(cap - offset);
        while self.pending() < offset + n {
            if self.fill(core) == 0 {
                break;
            }
        }
        let start = self.index + offset;
        let end = (start + n).min(self.size);
        if start >= end {
            return &[];
        }
        &self.buf.as_full()[start..end]
    }

    fn skip(&mut self, n: usize) {
        if n <= self.pending() {
            self.index += n;
        }
    }

    fn read_into(&mut self, out: &mut [u8], core: &mut Core) -> usize {
        let cap = self.buf.capacity();
        let mut done = 0;
        while done < out.len() {
            let want = (out.len() - done).min(cap);
            let avail = self.peek(want, 0, core);
            let got = avail.len();
            if got == 0 {
                break;
            }
            out[done..done + got].copy_from_slice(avail);
            self.skip(got);
            done += got;
        }
        done
    }

    fn take_in_place(&mut self, n: usize, core: &mut Core) -> Option<&[u8]> {
        if n > self.buf.capacity() || self.peek(n, 0, core).len() != n {
            return None;
        }
        let start = self.index;
        self.index += n;
        Some(&self.buf.as_full()[start..start + n])
    }

    fn take_compressed(&mut self, out: &mut [u8], core: &mut Core) -> Result<usize> {
        let mut prefix = [0u8; CHUNK_PREFIX_LEN];
        if self.read_into(&mut prefix, core) != CHUNK_PREFIX_LEN {
            return Err(truncated(core, "truncated compressed chunk header"));
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.buf.capacity() {
            let err = MigrationError::Compression(format!(
                "compressed chunk of {len} bytes exceeds the {} byte buffer",
                self.buf.capacity()
            ));
            core.fail(err.clone());
            return Err(err);
        }
        if self.peek(len, 0, core).len() != len {
            return Err(truncated(core, "truncated compressed chunk"));
        }
        let start = self.index;
        self.index += len;
        let decompressor = self.decompressor.get_or_insert_with(Decompressor::new);
        decompressor
            .decompress(out, &self.buf.as_full()[start..start + len])
            .inspect_err(|err| core.fail(err.clone()))
    }
}

fn truncated(core: &Core, what: &'static str) -> MigrationError {
    core.errors
        .get()
        .unwrap_or_else(|| MigrationError::Compression(what.into()))
}

/// Buffered, partially asynchronous byte stream used to save and load migration state.
///
/// `'a` bounds caller memory queued with [`MigrationStream::put_bytes_async`] and
/// [`MigrationStream::put_bytes_reclaimable`]; such memory must stay untouched until
/// the next flush, which the borrow enforces.
///
/// A single handle is not meant to be driven from several threads at once; only the
/// buffered write workers run concurrently with it.
pub struct MigrationStream<'a> {
    // Dropped before `core`: in-flight writes are drained and buffers released before
    // the transport goes away.
    backend: Backend<'a>,
    core: Core,
    config: StreamConfig,
    hooks: Option<Box<dyn MigrationHooks>>,
    xfer_limit: u64,
    closed: bool,
}

impl<'a> MigrationStream<'a> {
    pub fn open(
        transport: Arc<dyn Transport>,
        direction: Direction,
        config: StreamConfig,
    ) -> Result<Self> {
        Self::open_with_reclaimer(transport, direction, config, Arc::new(OsReclaimer))
    }

    /// Like [`MigrationStream::open`], with a custom sink for page reclaim hints.
    pub fn open_with_reclaimer(
        transport: Arc<dyn Transport>,
        direction: Direction,
        config: StreamConfig,
        reclaimer: Arc<dyn PageReclaimer>,
    ) -> Result<Self> {
        config.validate()?;
        let errors = Arc::new(ErrorSlot::default());
        let buffered = transport.supports_buffered_mode();

        let backend = match direction {
            Direction::Read => {
                if config.compression.is_some() {
                    return Err(MigrationError::InvalidConfig(
                        "compression applies to write streams only",
                    ));
                }
                Backend::Reader(ReadBuffer::new(&config)?)
            }
            Direction::Write if buffered => {
                if config.compression.is_some() {
                    return Err(MigrationError::UnsupportedMode {
                        mode: StreamMode::Buffered.as_str(),
                        op: "compression",
                    });
                }
                let pool = Arc::new(BufferPool::new(&config)?);
                let executor = WriteExecutor::with_errors(
                    Arc::clone(&transport),
                    Arc::clone(&pool),
                    Arc::clone(&errors),
                )?;
                Backend::Buffered(BufferedWriter {
                    current: Some(pool.acquire_current()),
                    executor,
                })
            }
            Direction::Write => Backend::Vectored(VectoredWriter::new(&config)?),
        };

        tracing::debug!(
            mode = backend.mode().as_str(),
            buffer_size = config.buffer_size,
            buffer_count = config.buffer_count,
            "opened migration stream"
        );

        Ok(Self {
            backend,
            core: Core {
                transport,
                errors,
                reclaimer,
                flushed: 0,
                transferred: 0,
                shutdown: false,
            },
            config,
            hooks: None,
            xfer_limit: 0,
            closed: false,
        })
    }

    pub fn mode(&self) -> StreamMode {
        self.backend.mode()
    }

    pub fn direction(&self) -> Direction {
        match self.backend {
            Backend::Reader(_) => Direction::Read,
            Backend::Buffered(_) | Backend::Vectored(_) => Direction::Write,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Returns whether write calls should proceed, recording misuse on a reader.
    fn writable(&mut self) -> bool {
        if self.core.failed() || self.closed {
            return false;
        }
        if matches!(self.backend, Backend::Reader(_)) {
            self.core.fail(MigrationError::WrongDirection { expected: "write" });
            return false;
        }
        true
    }

    fn readable(&mut self) -> bool {
        if self.core.failed() || self.closed {
            return false;
        }
        if !matches!(self.backend, Backend::Reader(_)) {
            self.core.fail(MigrationError::WrongDirection { expected: "read" });
            return false;
        }
        true
    }

    /// Copies `data` into the stream.
    pub fn put_bytes(&mut self, data: &[u8]) {
        if !self.writable() {
            return;
        }
        match &mut self.backend {
            Backend::Buffered(w) => w.put(data, &mut self.core),
            Backend::Vectored(w) => w.put(data, &mut self.core),
            Backend::Reader(_) => {}
        }
    }

    /// Queues `data` without copying in vectored mode; buffered mode copies it.
    pub fn put_bytes_async(&mut self, data: &'a [u8]) {
        if !self.writable() {
            return;
        }
        match &mut self.backend {
            Backend::Buffered(w) => w.put(data, &mut self.core),
            Backend::Vectored(w) => w.put_borrowed(data, &mut self.core),
            Backend::Reader(_) => {}
        }
    }

    /// Like [`MigrationStream::put_bytes_async`], and additionally allows the stream to
    /// tell the OS the pages backing `data` are no longer needed once they are sent.
    pub fn put_bytes_reclaimable(&mut self, data: &'a mut [u8]) {
        if !self.writable() {
            return;
        }
        match &mut self.backend {
            Backend::Buffered(w) => {
                w.put(data, &mut self.core);
                if !self.core.failed() {
                    let range = ReclaimRange {
                        addr: data.as_ptr() as usize,
                        len: data.len(),
                    };
                    discard_ranges(&*self.core.reclaimer, &[range]);
                }
            }
            Backend::Vectored(w) => w.put_reclaimable(data, &mut self.core),
            Backend::Reader(_) => {}
        }
    }

    pub fn put_byte(&mut self, v: u8) {
        self.put_bytes(&[v]);
    }

    pub fn put_be16(&mut self, v: u16) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_be32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_be64(&mut self, v: u64) {
        self.put_bytes(&v.to_be_bytes());
    }

    /// Writes `<u8 len><bytes>`. Strings of 256 bytes or more are rejected.
    pub fn put_counted_string(&mut self, s: &str) -> Result<()> {
        let len = u8::try_from(s.len())
            .map_err(|_| MigrationError::StringTooLong { len: s.len() })?;
        self.put_byte(len);
        self.put_bytes(s.as_bytes());
        Ok(())
    }

    /// Compresses `src` as one independent chunk framed as `<be32 len><payload>`.
    ///
    /// Only vectored writers opened with compression support this. Returns the number
    /// of bytes added to the stream, or [`MigrationError::WouldNotFit`] if the chunk
    /// cannot fit even an empty buffer.
    pub fn put_compressed(&mut self, src: &[u8]) -> Result<usize> {
        if !self.writable() {
            return Err(self
                .last_error()
                .unwrap_or(MigrationError::WrongDirection { expected: "write" }));
        }
        match &mut self.backend {
            Backend::Vectored(w) => w.put_compressed(src, &mut self.core),
            Backend::Buffered(_) => Err(MigrationError::UnsupportedMode {
                mode: StreamMode::Buffered.as_str(),
                op: "put_compressed",
            }),
            Backend::Reader(_) => Err(MigrationError::WrongDirection { expected: "write" }),
        }
    }

    /// Moves everything `src` has queued but not yet flushed into this stream and resets
    /// `src`. Borrowed regions are copied. `src` must be a vectored writer; returns the
    /// number of bytes moved.
    pub fn append_pending(&mut self, src: &mut MigrationStream<'_>) -> usize {
        if !self.writable() {
            return 0;
        }
        let Backend::Vectored(src_writer) = &mut src.backend else {
            return 0;
        };
        let core = &mut self.core;
        match &mut self.backend {
            Backend::Vectored(w) => src_writer.drain_into(|data| w.put(data, core)),
            Backend::Buffered(w) => src_writer.drain_into(|data| w.put(data, core)),
            Backend::Reader(_) => 0,
        }
    }

    /// Pushes out everything accepted so far.
    ///
    /// Vectored streams write synchronously. Buffered streams submit the current
    /// buffer, even if partially filled, and return without waiting for the write; they
    /// block only if no free buffer is left. A partial submission means later writes no
    /// longer start at buffer-size multiples, so callers targeting sinks that need
    /// aligned offsets should leave flushing to `close()`.
    pub fn flush(&mut self) {
        if self.core.failed() || self.closed {
            return;
        }
        match &mut self.backend {
            Backend::Buffered(w) => w.submit_current(&mut self.core, true),
            Backend::Vectored(w) => w.flush(&mut self.core),
            Backend::Reader(_) => {}
        }
    }

    /// Logical offset: flushed plus still-unflushed bytes for writers, bytes consumed
    /// for readers.
    pub fn tell(&self) -> u64 {
        match &self.backend {
            Backend::Buffered(w) => self.core.flushed + w.unflushed() as u64,
            Backend::Vectored(w) => self.core.flushed + w.unflushed() as u64,
            Backend::Reader(r) => self.core.flushed - r.pending() as u64,
        }
    }

    /// Bytes accepted but not yet handed to the transport or an in-flight task.
    pub fn unflushed(&self) -> usize {
        match &self.backend {
            Backend::Buffered(w) => w.unflushed(),
            Backend::Vectored(w) => w.unflushed(),
            Backend::Reader(_) => 0,
        }
    }

    /// Scatter/gather entries waiting for the next vectored flush.
    pub fn pending_entries(&self) -> &[IoEntry] {
        match &self.backend {
            Backend::Vectored(w) => w.iov.entries(),
            Backend::Buffered(_) | Backend::Reader(_) => &[],
        }
    }

    /// Background writes currently in flight (buffered mode only).
    pub fn in_flight_writes(&self) -> usize {
        match &self.backend {
            Backend::Buffered(w) => w.pool().in_flight(),
            Backend::Vectored(_) | Backend::Reader(_) => 0,
        }
    }

    /// Advances the flushed offset for bytes a fast-path hook sent out of band.
    pub fn update_position(&mut self, n: u64) {
        match self.backend {
            Backend::Vectored(_) => self.core.flushed += n,
            Backend::Buffered(_) | Backend::Reader(_) => {
                self.core.fail(MigrationError::UnsupportedMode {
                    mode: self.backend.mode().as_str(),
                    op: "update_position",
                });
            }
        }
    }

    /// Up to `n` bytes starting `offset` bytes past the read cursor, without consuming
    /// them. Shorter only at end of stream, on error, or when the window would exceed
    /// the internal buffer.
    pub fn peek_bytes(&mut self, n: usize, offset: usize) -> &[u8] {
        if !self.readable() {
            return &[];
        }
        match &mut self.backend {
            Backend::Reader(r) => r.peek(n, offset, &mut self.core),
            Backend::Buffered(_) | Backend::Vectored(_) => &[],
        }
    }

    /// Fills `out` and returns how many bytes were read; fewer than requested only at
    /// end of stream or on error.
    pub fn get_bytes(&mut self, out: &mut [u8]) -> usize {
        if !self.readable() {
            return 0;
        }
        match &mut self.backend {
            Backend::Reader(r) => r.read_into(out, &mut self.core),
            Backend::Buffered(_) | Backend::Vectored(_) => 0,
        }
    }

    /// Consumes `n` bytes and returns them without copying, if all `n` can be made
    /// resident in the internal buffer. Otherwise nothing is consumed and callers should
    /// fall back to [`MigrationStream::get_bytes`].
    pub fn get_bytes_in_place(&mut self, n: usize) -> Option<&[u8]> {
        if !self.readable() {
            return None;
        }
        match &mut self.backend {
            Backend::Reader(r) => r.take_in_place(n, &mut self.core),
            Backend::Buffered(_) | Backend::Vectored(_) => None,
        }
    }

    /// Consumes `n` already-peeked bytes. Skipping past resident data is ignored.
    pub fn skip(&mut self, n: usize) {
        if !self.readable() {
            return;
        }
        if let Backend::Reader(r) = &mut self.backend {
            r.skip(n);
        }
    }

    pub fn peek_byte(&mut self, offset: usize) -> Option<u8> {
        self.peek_bytes(1, offset).first().copied()
    }

    /// Next byte, or 0 at end of stream.
    pub fn get_byte(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.get_bytes(&mut b);
        b[0]
    }

    fn get_array<const N: usize>(&mut self) -> [u8; N] {
        let mut buf = [0u8; N];
        self.get_bytes(&mut buf);
        buf
    }

    pub fn get_be16(&mut self) -> u16 {
        u16::from_be_bytes(self.get_array())
    }

    pub fn get_be32(&mut self) -> u32 {
        u32::from_be_bytes(self.get_array())
    }

    pub fn get_be64(&mut self) -> u64 {
        u64::from_be_bytes(self.get_array())
    }

    /// Reads a `<u8 len><bytes>` string. `None` if it is truncated or not UTF-8.
    pub fn get_counted_string(&mut self) -> Option<String> {
        let len = self.peek_byte(0)? as usize;
        self.skip(1);
        let mut buf = vec![0u8; len];
        if self.get_bytes(&mut buf) != len {
            return None;
        }
        String::from_utf8(buf).ok()
    }

    /// Reads one `<be32 len><payload>` chunk and inflates it into `out`.
    pub fn get_compressed(&mut self, out: &mut [u8]) -> Result<usize> {
        if !self.readable() {
            return Err(self
                .last_error()
                .unwrap_or(MigrationError::WrongDirection { expected: "read" }));
        }
        match &mut self.backend {
            Backend::Reader(r) => r.take_compressed(out, &mut self.core),
            Backend::Buffered(_) | Backend::Vectored(_) => {
                Err(MigrationError::WrongDirection { expected: "read" })
            }
        }
    }

    /// The first error this stream recorded, if any.
    pub fn last_error(&self) -> Option<MigrationError> {
        self.core.errors.get()
    }

    /// Records `err` as the sticky error unless one is already set.
    pub fn set_error(&self, err: MigrationError) {
        self.core.fail(err);
    }

    /// Stops all further I/O and asks the transport to shut down. Records
    /// [`MigrationError::Shutdown`] if the stream had not failed yet.
    pub fn shutdown(&mut self) -> Result<()> {
        self.core.shutdown = true;
        let res = self.core.transport.shutdown();
        if !self.core.failed() {
            self.core.fail(MigrationError::Shutdown);
        }
        res.map_err(MigrationError::from)
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown
    }

    /// Flushes, waits for every in-flight write, closes the transport.
    ///
    /// Reports the first sticky error if there is one, even when closing itself failed
    /// differently; otherwise the transport's close result.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match &mut self.backend {
            Backend::Buffered(w) => {
                if !self.core.failed() {
                    w.submit_current(&mut self.core, false);
                }
                w.pool().drain_all();
            }
            Backend::Vectored(w) => w.flush(&mut self.core),
            Backend::Reader(_) => {}
        }

        let closed = self.core.transport.close();
        tracing::debug!(
            mode = self.backend.mode().as_str(),
            bytes = self.core.flushed,
            "closed migration stream"
        );
        if let Some(err) = self.core.errors.get() {
            if let Err(close_err) = closed {
                tracing::warn!(error = %close_err, "closing failed migration transport");
            }
            return Err(err);
        }
        closed.map_err(MigrationError::from)
    }

    /// Bytes allowed per period before [`MigrationStream::rate_limit_exceeded`] trips.
    /// 0 disables the limit.
    pub fn set_rate_limit(&mut self, bytes_per_period: u64) {
        self.xfer_limit = bytes_per_period;
    }

    pub fn rate_limit(&self) -> u64 {
        self.xfer_limit
    }

    pub fn reset_rate_counter(&mut self) {
        self.core.transferred = 0;
    }

    pub fn bytes_transferred_this_period(&self) -> u64 {
        self.core.transferred
    }

    /// Accounts for bytes moved outside the stream (e.g. by a hook).
    pub fn update_transfer(&mut self, len: u64) {
        self.core.transferred += len;
    }

    /// True when the caller should stop producing for this period: after shutdown, on
    /// a sticky error, or once the limit is exceeded.
    pub fn rate_limit_exceeded(&self) -> bool {
        if self.core.shutdown || self.core.failed() {
            return true;
        }
        self.xfer_limit > 0 && self.core.transferred > self.xfer_limit
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn MigrationHooks>) {
        self.hooks = Some(hooks);
    }

    pub fn before_iterate(&mut self, flags: u64) {
        if let Some(hooks) = self.hooks.as_mut() {
            if let Err(err) = hooks.before_iterate(flags) {
                self.core.fail(err);
            }
        }
    }

    pub fn after_iterate(&mut self, flags: u64) {
        if let Some(hooks) = self.hooks.as_mut() {
            if let Err(err) = hooks.after_iterate(flags) {
                self.core.fail(err);
            }
        }
    }

    /// Runs the load hook. A missing hook is only an error when the source sent
    /// [`RAM_CONTROL_HOOK`], i.e. explicitly expects one.
    pub fn load_hook(&mut self, flags: u64, data: &[u8]) {
        match self.hooks.as_mut().and_then(|h| h.load(flags, data)) {
            Some(Ok(())) => {}
            Some(Err(err)) => self.core.fail(err),
            None if flags == RAM_CONTROL_HOOK => self.core.fail(MigrationError::MissingLoadHook),
            None => {}
        }
    }

    /// Offers a page to the fast-path save hook.
    ///
    /// Anything but `NotSupported` counts `size` against the rate limit; `Sent` moves
    /// the flushed offset by the bytes the hook reported, `Failed` becomes sticky.
    pub fn save_page(&mut self, block_offset: u64, offset: u64, size: usize) -> SavePageOutcome {
        let Some(hooks) = self.hooks.as_mut() else {
            return SavePageOutcome::NotSupported;
        };
        let outcome = hooks.save_page(block_offset, offset, size);
        match &outcome {
            SavePageOutcome::NotSupported => {}
            SavePageOutcome::Delayed => self.core.transferred += size as u64,
            SavePageOutcome::Sent { bytes } => {
                self.core.transferred += size as u64;
                if *bytes > 0 {
                    self.update_position(*bytes);
                }
            }
            SavePageOutcome::Failed(err) => {
                self.core.transferred += size as u64;
                self.core.fail(err.clone());
            }
        }
        outcome
    }
}

impl Drop for MigrationStream<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::debug!(error = %err, "migration stream dropped after failure");
        }
    }
}

impl std::fmt::Debug for MigrationStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStream")
            .field("mode", &self.mode())
            .field("tell", &self.tell())
            .field("last_error", &self.last_error())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

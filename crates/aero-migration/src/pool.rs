//! Buffer pool and background write executor for buffered streams.
//!
//! The pool owns a fixed set of [`AlignedBuffer`]s. At any time a buffer is either
//! the stream's current buffer, on the free list, or inside a write task at the
//! executor. Every finished task returns its buffer to the free list exactly once,
//! whether the write succeeded or not, which is what keeps [`BufferPool::wait_for_free`]
//! from deadlocking.

use std::io::{self, IoSlice};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::buffer::AlignedBuffer;
use crate::config::StreamConfig;
use crate::error::{ErrorSlot, MigrationError, Result};
use crate::transport::Transport;

#[derive(Debug)]
struct PoolState {
    free: Vec<AlignedBuffer>,
    in_flight: usize,
}

/// Fixed set of aligned buffers plus the count of writes in flight.
#[derive(Debug)]
pub struct BufferPool {
    state: Mutex<PoolState>,
    changed: Condvar,
    buffer_count: usize,
}

impl BufferPool {
    /// Eagerly allocates `config.buffer_count` buffers onto the free list.
    pub fn new(config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        let mut free = Vec::with_capacity(config.buffer_count);
        for _ in 0..config.buffer_count {
            free.push(AlignedBuffer::new(config.buffer_size, config.alignment)?);
        }
        Ok(Self {
            state: Mutex::new(PoolState { free, in_flight: 0 }),
            changed: Condvar::new(),
            buffer_count: config.buffer_count,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn try_acquire(&self) -> Option<AlignedBuffer> {
        self.lock().free.pop()
    }

    /// Blocks until a buffer is on the free list and takes it.
    pub fn wait_for_free(&self) -> AlignedBuffer {
        let mut state = self.lock();
        loop {
            if let Some(mut buf) = state.free.pop() {
                buf.clear();
                return buf;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Takes the next current buffer for a stream. Only blocks when every buffer is
    /// in flight.
    pub fn acquire_current(&self) -> AlignedBuffer {
        if let Some(mut buf) = self.try_acquire() {
            buf.clear();
            return buf;
        }
        tracing::trace!(
            buffers = self.buffer_count,
            "all migration buffers in flight; waiting"
        );
        self.wait_for_free()
    }

    /// Blocks until no task is in flight.
    pub fn drain_all(&self) {
        let mut state = self.lock();
        while state.in_flight > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn begin_task(&self) {
        self.lock().in_flight += 1;
    }

    fn complete_task(&self, mut buffer: AlignedBuffer) {
        buffer.clear();
        let mut state = self.lock();
        debug_assert!(state.in_flight > 0, "task completed with nothing in flight");
        state.in_flight = state.in_flight.saturating_sub(1);
        state.free.push(buffer);
        drop(state);
        self.changed.notify_all();
    }

    /// Puts a buffer that never reached the executor back on the free list.
    pub(crate) fn release(&self, mut buffer: AlignedBuffer) {
        buffer.clear();
        self.lock().free.push(buffer);
        self.changed.notify_all();
    }
}

/// One background write: a filled buffer and the stream offset it belongs at.
#[derive(Debug)]
struct WriteTask {
    buffer: AlignedBuffer,
    offset: u64,
}

/// Completion handle for a submitted write. Dropping it is fine; failures are also
/// recorded on the executor's sticky error.
#[derive(Debug)]
pub struct WriteTicket {
    offset: u64,
    len: usize,
    done: Receiver<Result<usize>>,
}

impl WriteTicket {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Blocks until the write finished and returns the number of bytes written.
    pub fn wait(self) -> Result<usize> {
        self.done.recv().unwrap_or(Err(MigrationError::ExecutorGone))
    }

    /// Returns the outcome if the write already finished.
    pub fn try_result(&self) -> Option<Result<usize>> {
        self.done.try_recv().ok()
    }
}

struct Job {
    task: WriteTask,
    done: SyncSender<Result<usize>>,
}

/// Bounded worker pool that flushes full buffers to the transport off the
/// producer's thread.
pub struct WriteExecutor {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pool: Arc<BufferPool>,
    errors: Arc<ErrorSlot>,
}

impl WriteExecutor {
    /// Spawns one worker per pool buffer, so every buffer can be in flight at once.
    pub fn new(transport: Arc<dyn Transport>, pool: Arc<BufferPool>) -> Result<Self> {
        Self::with_errors(transport, pool, Arc::new(ErrorSlot::default()))
    }

    /// Like [`WriteExecutor::new`], recording failures in a slot shared with a stream.
    pub(crate) fn with_errors(
        transport: Arc<dyn Transport>,
        pool: Arc<BufferPool>,
        errors: Arc<ErrorSlot>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(pool.buffer_count());
        for idx in 0..pool.buffer_count() {
            let rx = Arc::clone(&rx);
            let transport = Arc::clone(&transport);
            let pool = Arc::clone(&pool);
            let slot = Arc::clone(&errors);
            let handle = thread::Builder::new()
                .name(format!("migration-writer-{idx}"))
                .spawn(move || worker_loop(&rx, &*transport, &pool, &slot))?;
            workers.push(handle);
        }
        Ok(Self {
            jobs: Some(tx),
            workers,
            pool,
            errors,
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// First failed background write, if any.
    pub fn last_error(&self) -> Option<MigrationError> {
        self.errors.get()
    }

    /// Hands `buffer` to a worker. Ownership moves with the task; the buffer comes
    /// back through the pool's free list once the write finished.
    pub fn submit_flush(&self, buffer: AlignedBuffer, offset: u64) -> Result<WriteTicket> {
        let len = buffer.len();
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let Some(jobs) = &self.jobs else {
            self.pool.release(buffer);
            return Err(MigrationError::ExecutorGone);
        };
        self.pool.begin_task();
        let job = Job {
            task: WriteTask { buffer, offset },
            done: done_tx,
        };
        if let Err(mpsc::SendError(job)) = jobs.send(job) {
            // No worker left to run it; undo the accounting.
            self.pool.complete_task(job.task.buffer);
            return Err(MigrationError::ExecutorGone);
        }
        tracing::trace!(offset, len, "submitted background migration write");
        Ok(WriteTicket {
            offset,
            len,
            done: done_rx,
        })
    }
}

impl Drop for WriteExecutor {
    fn drop(&mut self) {
        // Closing the channel lets idle workers exit once the queue is empty.
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("migration writer thread panicked");
            }
        }
    }
}

fn worker_loop(
    jobs: &Mutex<Receiver<Job>>,
    transport: &dyn Transport,
    pool: &BufferPool,
    errors: &ErrorSlot,
) {
    loop {
        let job = {
            let rx = jobs.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(Job { task, done }) = job else {
            return;
        };

        let expected = task.buffer.len();
        let write = panic::catch_unwind(AssertUnwindSafe(|| {
            transport.write_vectored_at(&[IoSlice::new(task.buffer.as_slice())], task.offset)
        }));
        let outcome = match write {
            Ok(Ok(written)) if written == expected => Ok(written),
            Ok(Ok(written)) => Err(MigrationError::ShortWrite { expected, written }),
            Ok(Err(err)) => Err(MigrationError::from(err)),
            Err(_) => {
                tracing::warn!(offset = task.offset, "migration transport panicked during write");
                Err(MigrationError::from(io::Error::other(
                    "transport panicked during a background write",
                )))
            }
        };

        // The stream must observe the failure before the buffer becomes reusable.
        if let Err(err) = &outcome {
            errors.set(err.clone());
        }
        pool.complete_task(task.buffer);
        let _ = done.send(outcome);
    }
}

mod buffer;
mod fd;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::lock::{Lock, Release};
use crate::stream::{ReadStream, StreamOptions, WriteStream};
use crate::{Result, SlicerError};

pub use buffer::{BufferSlicer, BufferSlicerOptions};
pub use fd::{FdSlicer, FdSlicerOptions, PositionalIo, SlicerState};

/// Result of an operation that hands its buffer back to the caller.
pub type BufResult<T> = (Result<T>, Vec<u8>);

/// Completion of one physical operation: bytes transferred and the buffer.
pub type Completion = Box<dyn FnOnce(Result<usize>, Vec<u8>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A shared resource that serializes every physical read and write through
/// its own [`Lock`] and keeps a count of the streams using it.
///
/// Implementations are cheap handles: clones share the resource, the lock
/// and the reference count.
pub trait ResourceSlicer: Clone + Send + Sync + Unpin + 'static {
    /// The gate every physical operation is admitted through.
    fn lock(&self) -> &Lock;

    fn ref_count(&self) -> usize;

    /// Increase the reference count by one.
    fn add_ref(&self);

    /// Decrease the reference count by one.
    ///
    /// # Errors
    /// [`SlicerError::InvalidUnref`] if the count is already zero.
    fn unref(&self) -> Result<()>;

    /// Upper bound of write streams opened without an explicit `end`.
    fn natural_end(&self) -> Option<u64>;

    /// Largest single read a stream may issue.
    fn max_chunk_size(&self) -> usize;

    /// Perform exactly one physical read of `length` bytes at `position`
    /// into `buf[offset..]`. Must only be called by an admitted operation;
    /// `done` is always called, and never inline.
    fn read_admitted(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        done: Completion,
    );

    /// Write counterpart of [`ResourceSlicer::read_admitted`].
    fn write_admitted(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        done: Completion,
    );

    /// Read into `buf[offset..offset + length]` from `position`, once the
    /// lock admits the operation. A short read is not an error.
    fn read<F>(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        callback: F,
    ) where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        self.submit(
            Direction::Read,
            buf,
            offset,
            length,
            position,
            None,
            callback,
        );
    }

    /// Write `buf[offset..offset + length]` at `position`, once the lock
    /// admits the operation.
    fn write<F>(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        callback: F,
    ) where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        self.submit(
            Direction::Write,
            buf,
            offset,
            length,
            position,
            None,
            callback,
        );
    }

    /// Queue one physical operation behind the lock. When `cancelled` is set
    /// by the time the operation is admitted, it is released without
    /// touching the resource and `callback` receives `Ok(0)`.
    #[allow(clippy::too_many_arguments)]
    fn submit<F>(
        &self,
        direction: Direction,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        cancelled: Option<Arc<AtomicBool>>,
        callback: F,
    ) where
        F: FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    {
        let this = self.clone();
        self.lock().acquire(move |release| {
            if cancelled.map_or(false, |flag| flag.load(Ordering::Acquire)) {
                log::trace!("skipping {direction:?} at {position}: stream destroyed");
                release_admitted(&release);
                callback(Ok(0), buf);
                return;
            }

            log::trace!("{direction:?} of {length} bytes at {position}");
            let done: Completion = Box::new(move |result, buf| {
                release_admitted(&release);
                callback(result, buf);
            });
            match direction {
                Direction::Read => {
                    this.read_admitted(buf, offset, length, position, done)
                }
                Direction::Write => {
                    this.write_admitted(buf, offset, length, position, done)
                }
            }
        });
    }

    /// Fill the whole of `buf` from `position`, as far as the resource goes.
    ///
    /// The operation is queued when this is called, not when the future is
    /// first polled, and dropping the future does not cancel it.
    fn read_at(
        &self,
        buf: Vec<u8>,
        position: u64,
    ) -> impl Future<Output = BufResult<usize>> + Send {
        let (tx, rx) = oneshot::channel();
        let length = buf.len();
        self.read(buf, 0, length, position, move |result, buf| {
            let _ = tx.send((result, buf));
        });
        async move { rx.await.unwrap_or_else(|_| (Err(SlicerError::Closed), Vec::new())) }
    }

    /// Write the whole of `buf` at `position`. See [`ResourceSlicer::read_at`].
    fn write_at(
        &self,
        buf: Vec<u8>,
        position: u64,
    ) -> impl Future<Output = BufResult<usize>> + Send {
        let (tx, rx) = oneshot::channel();
        let length = buf.len();
        self.write(buf, 0, length, position, move |result, buf| {
            let _ = tx.send((result, buf));
        });
        async move { rx.await.unwrap_or_else(|_| (Err(SlicerError::Closed), Vec::new())) }
    }

    /// Open a read stream over the `[start, end)` window of `options`.
    fn create_read_stream(
        &self,
        options: StreamOptions,
    ) -> Result<ReadStream<Self>> {
        ReadStream::new(self.clone(), options)
    }

    /// Open a write stream over the `[start, end)` window of `options`.
    fn create_write_stream(
        &self,
        options: StreamOptions,
    ) -> Result<WriteStream<Self>> {
        WriteStream::new(self.clone(), options)
    }
}

fn release_admitted(release: &Release) {
    if let Err(err) = release.release(None) {
        log::error!("failed to release physical operation: {err}");
    }
}

/// Validate that `offset..offset + length` lies within a buffer.
pub(crate) fn check_range(
    capacity: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(SlicerError::OutOfBounds {
            offset,
            length,
            capacity,
        }),
    }
}

/// Reference count which refuses to go below zero.
#[derive(Debug, Default)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the new count.
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the new count.
    pub fn decrement(&self) -> Result<usize> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map(|previous| previous - 1)
            .map_err(|_| SlicerError::InvalidUnref)
    }
}

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::{check_range, Completion, RefCount, ResourceSlicer};
use crate::lock::Lock;
use crate::{Result, SlicerError, DEFAULT_CHUNK_SIZE};

/// Positional storage primitive wrapped by an [`FdSlicer`].
///
/// Calls are made from Tokio's blocking pool, never more than one at a time
/// per slicer.
pub trait PositionalIo: Send + Sync + 'static {
    fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize>;

    fn write_at(&self, buf: &[u8], position: u64) -> io::Result<usize>;

    /// Release the resource. Called at most once, after the last admitted
    /// operation completed.
    fn close(self) -> io::Result<()>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }
}

impl PositionalIo for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, position)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], position: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, position)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, position)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], position: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, position)
    }
}

/// Shared handle: closing it only drops this reference, the resource stays
/// open for whoever else holds it.
impl<T: PositionalIo> PositionalIo for Arc<T> {
    fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
        (**self).read_at(buf, position)
    }

    fn write_at(&self, buf: &[u8], position: u64) -> io::Result<usize> {
        (**self).write_at(buf, position)
    }
}

/// Options to create [`FdSlicer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FdSlicerOptions {
    /// Close the resource once the last stream (or manual reference) using
    /// it goes away.
    pub auto_close: bool,
}

/// Lifecycle of the resource behind an [`FdSlicer`].
#[derive(Debug, Clone)]
pub enum SlicerState {
    Open,
    Closing,
    Closed,
    Failed(SlicerError),
}

impl SlicerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

struct Inner<H> {
    handle: Mutex<Option<Arc<H>>>,
    refs: RefCount,
    auto_close: bool,
    lock: Lock,
    runtime: Handle,
    closing: AtomicBool,
    state: watch::Sender<SlicerState>,
}

impl<H> Inner<H> {
    fn handle(&self) -> Option<Arc<H>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_handle(&self) -> Option<Arc<H>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Slices one positional resource, usually an open file, into any number
/// of independent read and write streams.
///
/// Every physical operation goes through a lock admitting one operation at
/// a time, so streams never race on the resource.
pub struct FdSlicer<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for FdSlicer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: PositionalIo> FdSlicer<H> {
    /// Wrap `handle`. Make sure it was opened for reading if read streams
    /// are going to be used, and for writing if write streams are.
    ///
    /// # Panics
    /// When called outside of a Tokio runtime.
    pub fn new(handle: H, options: FdSlicerOptions) -> Self {
        let (state, _) = watch::channel(SlicerState::Open);
        Self {
            inner: Arc::new(Inner {
                handle: Mutex::new(Some(Arc::new(handle))),
                refs: RefCount::default(),
                auto_close: options.auto_close,
                lock: Lock::with_max(1),
                runtime: Handle::current(),
                closing: AtomicBool::new(false),
                state,
            }),
        }
    }

    pub fn auto_close(&self) -> bool {
        self.inner.auto_close
    }

    pub fn state(&self) -> SlicerState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to lifecycle changes of the resource.
    pub fn state_changes(&self) -> watch::Receiver<SlicerState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the resource was closed by auto-close, with the close
    /// error if closing failed.
    pub async fn closed(&self) -> Result<()> {
        let mut changes = self.inner.state.subscribe();
        let state = changes
            .wait_for(SlicerState::is_terminal)
            .await
            .map_err(|_| SlicerError::Closed)?;
        match &*state {
            SlicerState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

/// Close the resource once every admitted operation finished. Scheduled at
/// most once at a time; a close that finds the resource referenced again is
/// cancelled and rescheduled if the count dropped back to zero meanwhile.
fn schedule_close<H: PositionalIo>(inner: &Arc<Inner<H>>) {
    if inner.closing.swap(true, Ordering::AcqRel) {
        return;
    }
    log::debug!("no references left, closing resource");
    inner.state.send_replace(SlicerState::Closing);

    let admitted = inner.clone();
    inner.lock.acquire(move |release| {
        let inner = admitted;
        if inner.refs.get() > 0 {
            log::debug!("resource referenced again, close cancelled");
            inner.state.send_replace(SlicerState::Open);
            inner.closing.store(false, Ordering::Release);
            if let Err(err) = release.release(None) {
                log::error!("failed to release close: {err}");
            }
            // an unref racing with the cancellation saw `closing` still set
            if inner.refs.get() == 0 {
                schedule_close(&inner);
            }
            return;
        }

        let handle = inner.take_handle();
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            let result = match handle.map(Arc::try_unwrap) {
                Some(Ok(handle)) => {
                    match tokio::task::spawn_blocking(move || handle.close())
                        .await
                    {
                        Ok(closed) => closed.map_err(SlicerError::from),
                        Err(err) => Err(SlicerError::from(err)),
                    }
                }
                Some(Err(shared)) => {
                    log::warn!(
                        "resource shared by {} more handles, not closed",
                        Arc::strong_count(&shared) - 1
                    );
                    Ok(())
                }
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    log::debug!("resource closed");
                    inner.state.send_replace(SlicerState::Closed);
                }
                Err(err) => {
                    log::error!("failed to close resource: {err}");
                    inner.state.send_replace(SlicerState::Failed(err));
                }
            }
            if let Err(err) = release.release(None) {
                log::error!("failed to release close: {err}");
            }
        });
    });
}

impl FdSlicer<File> {
    /// Open `path` for reading and writing and wrap it.
    pub async fn open(
        path: impl AsRef<Path>,
        options: FdSlicerOptions,
    ) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?
            .into_std()
            .await;
        Ok(Self::new(file, options))
    }
}

impl<H: PositionalIo> ResourceSlicer for FdSlicer<H> {
    fn lock(&self) -> &Lock {
        &self.inner.lock
    }

    fn ref_count(&self) -> usize {
        self.inner.refs.get()
    }

    fn add_ref(&self) {
        let count = self.inner.refs.increment();
        log::debug!("ref: {count} references");
    }

    fn unref(&self) -> Result<()> {
        let count = self.inner.refs.decrement()?;
        log::debug!("unref: {count} references left");
        if count == 0 && self.inner.auto_close {
            schedule_close(&self.inner);
        }
        Ok(())
    }

    fn natural_end(&self) -> Option<u64> {
        None
    }

    fn max_chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    fn read_admitted(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        done: Completion,
    ) {
        let handle = self.inner.handle();
        self.inner.runtime.spawn(async move {
            // no clone of the handle may outlive the completion, a close
            // admitted right after it unwraps the last one
            if let Err(err) = check_range(buf.len(), offset, length) {
                drop(handle);
                return done(Err(err), buf);
            }
            let Some(handle) = handle else {
                return done(Err(SlicerError::Closed), buf);
            };
            let physical = tokio::task::spawn_blocking(move || {
                let mut buf = buf;
                let read =
                    handle.read_at(&mut buf[offset..offset + length], position);
                (read, buf)
            });
            match physical.await {
                Ok((read, buf)) => done(read.map_err(SlicerError::from), buf),
                Err(err) => done(Err(err.into()), Vec::new()),
            }
        });
    }

    fn write_admitted(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        done: Completion,
    ) {
        let handle = self.inner.handle();
        self.inner.runtime.spawn(async move {
            if let Err(err) = check_range(buf.len(), offset, length) {
                drop(handle);
                return done(Err(err), buf);
            }
            let Some(handle) = handle else {
                return done(Err(SlicerError::Closed), buf);
            };
            let physical = tokio::task::spawn_blocking(move || {
                let written =
                    handle.write_at(&buf[offset..offset + length], position);
                (written, buf)
            });
            match physical.await {
                Ok((written, buf)) => {
                    done(written.map_err(SlicerError::from), buf)
                }
                Err(err) => done(Err(err.into()), Vec::new()),
            }
        });
    }
}

impl<H> fmt::Debug for FdSlicer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdSlicer")
            .field("ref_count", &self.inner.refs.get())
            .field("auto_close", &self.inner.auto_close)
            .field("lock", &self.inner.lock)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use super::{check_range, Completion, RefCount, ResourceSlicer};
use crate::lock::Lock;
use crate::Result;

/// Options to create [`BufferSlicer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BufferSlicerOptions {
    /// Largest chunk a read stream emits at once. Unbounded when unset.
    pub max_chunk_size: Option<usize>,
}

struct Inner {
    buffer: Mutex<Vec<u8>>,
    len: usize,
    refs: RefCount,
    lock: Lock,
    max_chunk_size: usize,
    runtime: Handle,
}

impl Inner {
    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory counterpart of [`super::FdSlicer`] over a fixed-size buffer.
///
/// Operations copy bytes instead of calling into the file system but keep
/// the same ordering: admitted one at a time, completed on a later tick.
/// There is nothing to close.
#[derive(Clone)]
pub struct BufferSlicer {
    inner: Arc<Inner>,
}

impl BufferSlicer {
    /// # Panics
    /// When called outside of a Tokio runtime.
    pub fn new(buffer: Vec<u8>, options: BufferSlicerOptions) -> Self {
        let max_chunk_size = match options.max_chunk_size {
            Some(0) | None => usize::MAX,
            Some(size) => size,
        };
        Self {
            inner: Arc::new(Inner {
                len: buffer.len(),
                buffer: Mutex::new(buffer),
                refs: RefCount::default(),
                lock: Lock::with_max(1),
                max_chunk_size,
                runtime: Handle::current(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Copy of the backing bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.buffer().clone()
    }

    /// Take the backing bytes back, if this is the last handle.
    pub fn into_inner(self) -> std::result::Result<Vec<u8>, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Ok(inner
                .buffer
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)),
            Err(inner) => Err(Self { inner }),
        }
    }
}

fn start_of(position: u64, len: usize) -> usize {
    usize::try_from(position).map_or(len, |position| position.min(len))
}

impl ResourceSlicer for BufferSlicer {
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
        Ok(())
    }

    fn natural_end(&self) -> Option<u64> {
        Some(self.inner.len as u64)
    }

    fn max_chunk_size(&self) -> usize {
        self.inner.max_chunk_size
    }

    /// Reads past the end of the buffer are truncated to what is there.
    fn read_admitted(
        &self,
        mut buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        done: Completion,
    ) {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            if let Err(err) = check_range(buf.len(), offset, length) {
                return done(Err(err), buf);
            }
            let copied = {
                let source = inner.buffer();
                let start = start_of(position, source.len());
                let count = length.min(source.len() - start);
                buf[offset..offset + count]
                    .copy_from_slice(&source[start..start + count]);
                count
            };
            done(Ok(copied), buf);
        });
    }

    /// Writes past the end of the buffer are truncated to what fits.
    fn write_admitted(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
        done: Completion,
    ) {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            if let Err(err) = check_range(buf.len(), offset, length) {
                return done(Err(err), buf);
            }
            let copied = {
                let mut target = inner.buffer();
                let start = start_of(position, target.len());
                let count = length.min(target.len() - start);
                target[start..start + count]
                    .copy_from_slice(&buf[offset..offset + count]);
                count
            };
            done(Ok(copied), buf);
        });
    }
}

impl fmt::Debug for BufferSlicer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSlicer")
            .field("len", &self.inner.len)
            .field("ref_count", &self.inner.refs.get())
            .field("max_chunk_size", &self.inner.max_chunk_size)
            .field("lock", &self.inner.lock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SlicerError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn invalid_unref() {
        let slicer = BufferSlicer::new(vec![0; 16], Default::default());

        slicer.add_ref();
        slicer.unref().unwrap();

        let err = slicer.unref().unwrap_err();
        assert!(matches!(err, SlicerError::InvalidUnref));
    }

    #[tokio::test]
    async fn read_and_write() {
        let slicer = BufferSlicer::new(
            b"through the tangled thread the needle finds its way".to_vec(),
            Default::default(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        slicer.read(vec![0; 1024], 10, 11, 8, move |result, buf| {
            tx.send((result, buf)).unwrap();
        });
        let (result, buf) = rx.await.unwrap();
        assert_eq!(result.unwrap(), 11);
        assert_eq!(&buf[10..21], b"the tangled");

        let (result, _) = slicer.write_at(b"derp".to_vec(), 7).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(&slicer.contents()[7..19], b"derp tangled");
    }

    #[tokio::test]
    async fn read_past_end_is_truncated() {
        let slicer = BufferSlicer::new(b"abcdef".to_vec(), Default::default());

        let (result, buf) = slicer.read_at(vec![0; 4], 4).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");

        let (result, _) = slicer.read_at(vec![0; 4], 6).await;
        assert_eq!(result.unwrap(), 0);
        let (result, _) = slicer.read_at(vec![0; 4], u64::MAX).await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn completion_is_never_inline() {
        let slicer = BufferSlicer::new(b"abc".to_vec(), Default::default());
        let called = Arc::new(AtomicBool::new(false));

        let flag = called.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        slicer.read(vec![0; 3], 0, 3, 0, move |_, _| {
            flag.store(true, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
        assert!(!called.load(Ordering::SeqCst));

        rx.await.unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn into_inner_needs_last_handle() {
        let slicer = BufferSlicer::new(b"abc".to_vec(), Default::default());
        let other = slicer.clone();

        let slicer = slicer.into_inner().unwrap_err();
        drop(other);
        assert_eq!(slicer.into_inner().unwrap(), b"abc");
    }

    #[test]
    fn options_from_json() {
        let options: BufferSlicerOptions =
            serde_json::from_str(r#"{"maxChunkSize": 4}"#).unwrap();
        assert_eq!(options.max_chunk_size, Some(4));
    }
}

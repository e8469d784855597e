use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::AsyncWrite;
use tokio::sync::{oneshot, watch};

use super::{StreamOptions, Window};
use crate::slicer::{BufResult, Direction, ResourceSlicer};
use crate::{Result, SlicerError};

enum WriteState {
    Idle,
    Writing(oneshot::Receiver<BufResult<usize>>),
    Ended,
    Failed(SlicerError),
}

/// Represents a writable stream over a window of a [`ResourceSlicer`].
///
/// A chunk that would cross the end of the window is rejected with
/// [`SlicerError::TooBig`] before anything is written, after which the
/// stream stops functioning. Every accepted chunk bumps the total published
/// on [`WriteStream::progress`].
pub struct WriteStream<S: ResourceSlicer> {
    slicer: S,
    window: Window,
    pos: u64,
    bytes_written: u64,
    state: WriteState,
    destroyed: Arc<AtomicBool>,
    referenced: bool,
    progress: watch::Sender<u64>,
}

impl<S: ResourceSlicer> WriteStream<S> {
    pub(crate) fn new(slicer: S, options: StreamOptions) -> Result<Self> {
        let end = options.end.or_else(|| slicer.natural_end());
        let window = Window::new(options.start, end)?;
        slicer.add_ref();
        let (progress, _) = watch::channel(0);
        Ok(Self {
            slicer,
            window,
            pos: window.start(),
            bytes_written: 0,
            state: WriteState::Idle,
            destroyed: Arc::new(AtomicBool::new(false)),
            referenced: true,
            progress,
        })
    }

    pub fn start(&self) -> u64 {
        self.window.start()
    }

    pub fn end(&self) -> Option<u64> {
        self.window.end()
    }

    /// The current position of the stream in the resource.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// The number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Watch the running total of bytes written.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Abort the stream. An admitted write still completes, a queued one is
    /// skipped; the slicer reference is released once.
    pub fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::Release);
        if !matches!(self.state, WriteState::Failed(_)) {
            self.state = WriteState::Ended;
        }
        self.unref();
    }

    fn fail(&mut self, err: SlicerError) -> io::Error {
        log::debug!("write stream failed at {}: {err}", self.pos);
        self.state = WriteState::Failed(err.clone());
        self.unref();
        err.into()
    }

    fn unref(&mut self) {
        if std::mem::take(&mut self.referenced) {
            if let Err(err) = self.slicer.unref() {
                log::error!("write stream released its slicer: {err}");
            }
        }
    }

    fn advance(&mut self, count: usize) {
        self.pos += count as u64;
        self.bytes_written += count as u64;
        self.progress.send_replace(self.bytes_written);
    }

    /// Drive an in-flight write to completion.
    fn poll_in_flight(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<usize>>> {
        let rx = match self.state {
            WriteState::Writing(ref mut rx) => rx,
            _ => return Poll::Ready(None),
        };
        let (result, _) = ready!(Pin::new(rx).poll(cx))
            .unwrap_or_else(|_| (Err(SlicerError::Closed), Vec::new()));
        self.state = WriteState::Idle;
        Poll::Ready(Some(match result {
            Ok(count) => {
                self.advance(count);
                Ok(count)
            }
            Err(err) => Err(self.fail(err)),
        }))
    }
}

impl<S: ResourceSlicer> AsyncWrite for WriteStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.state {
            WriteState::Failed(ref err) => {
                return Poll::Ready(Err(err.clone().into()))
            }
            WriteState::Ended => {
                return Poll::Ready(Err(SlicerError::Closed.into()))
            }
            WriteState::Writing(_) => {
                if let Some(result) = ready!(this.poll_in_flight(cx)) {
                    return Poll::Ready(result);
                }
            }
            WriteState::Idle => {}
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if !this.window.fits(this.pos, buf.len() as u64) {
            return Poll::Ready(Err(this.fail(SlicerError::TooBig)));
        }

        let (tx, rx) = oneshot::channel();
        this.slicer.submit(
            Direction::Write,
            buf.to_vec(),
            0,
            buf.len(),
            this.pos,
            Some(this.destroyed.clone()),
            move |result, chunk| {
                let _ = tx.send((result, chunk));
            },
        );
        this.state = WriteState::Writing(rx);

        match ready!(this.poll_in_flight(cx)) {
            Some(result) => Poll::Ready(result),
            None => Poll::Ready(Ok(0)),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let WriteState::Failed(ref err) = this.state {
            return Poll::Ready(Err(err.clone().into()));
        }
        match ready!(this.poll_in_flight(cx)) {
            Some(Err(err)) => Poll::Ready(Err(err)),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let WriteState::Writing(_) = this.state {
            if let Some(Err(err)) = ready!(this.poll_in_flight(cx)) {
                return Poll::Ready(Err(err));
            }
        }
        match this.state {
            WriteState::Failed(ref err) => {
                return Poll::Ready(Err(err.clone().into()))
            }
            WriteState::Idle => {
                log::trace!(
                    "write stream finished after {} bytes",
                    this.bytes_written
                );
                this.state = WriteState::Ended;
            }
            _ => {}
        }
        this.unref();
        Poll::Ready(Ok(()))
    }
}

impl<S: ResourceSlicer> Drop for WriteStream<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferSlicer, FdSlicer, PositionalIo};
    use rstest::rstest;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    /// Storage whose writes fail after a while.
    struct DiskFull;

    impl PositionalIo for DiskFull {
        fn read_at(&self, _: &mut [u8], _: u64) -> io::Result<usize> {
            Ok(0)
        }

        fn write_at(&self, _: &[u8], _: u64) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(50));
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    fn too_big(err: &io::Error) -> bool {
        matches!(
            err.get_ref()
                .and_then(|inner| inner.downcast_ref::<SlicerError>()),
            Some(SlicerError::TooBig)
        )
    }

    #[tokio::test]
    async fn exceeding_buffer_size_fails() {
        let slicer = BufferSlicer::new(vec![0; 4], Default::default());
        let mut stream =
            slicer.create_write_stream(Default::default()).unwrap();
        assert_eq!(stream.end(), Some(4));

        stream.write_all(b"hi!\n").await.unwrap();
        let err = stream.write_all(b"it warked\n").await.unwrap_err();

        assert!(too_big(&err));
        assert_eq!(slicer.contents(), b"hi!\n");
        assert_eq!(stream.bytes_written(), 4);
        assert_eq!(slicer.ref_count(), 0);

        let err = stream.write_all(b"!").await.unwrap_err();
        assert!(too_big(&err));
    }

    #[tokio::test]
    async fn writes_within_buffer() {
        let slicer = BufferSlicer::new(vec![0; 1024], Default::default());
        let mut stream =
            slicer.create_write_stream(Default::default()).unwrap();

        stream.write_all(b"hi!\n").await.unwrap();
        stream.write_all(b"it warked\n").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(&slicer.contents()[..14], b"hi!\nit warked\n");
        assert_eq!(stream.pos(), 14);
        assert_eq!(slicer.ref_count(), 0);

        let err = stream.write_all(b"late").await.unwrap_err();
        assert!(!too_big(&err));
    }

    #[rstest]
    #[case(0, 1000, 1000, true)]
    #[case(0, 1000, 1001, false)]
    #[case(1, 1000, 1000, false)]
    #[tokio::test]
    async fn window_end_is_enforced(
        #[case] start: u64,
        #[case] end: u64,
        #[case] size: usize,
        #[case] accepted: bool,
    ) {
        let slicer = BufferSlicer::new(vec![0; 2048], Default::default());
        let mut stream = slicer
            .create_write_stream(StreamOptions::range(start, end))
            .unwrap();

        let result = stream.write_all(&vec![7; size]).await;
        assert_eq!(result.is_ok(), accepted);
        if !accepted {
            assert!(too_big(&result.unwrap_err()));
            assert!(slicer.contents().iter().all(|byte| *byte == 0));
        }
    }

    #[tokio::test]
    async fn start_offsets_the_writes() {
        let slicer = BufferSlicer::new(vec![b'.'; 8], Default::default());
        let mut stream = slicer
            .create_write_stream(StreamOptions::default().with_start(3))
            .unwrap();

        stream.write_all(b"abc").await.unwrap();
        assert_eq!(slicer.contents(), b"...abc..");
        assert_eq!(stream.pos(), 6);
    }

    #[tokio::test]
    async fn progress_tracks_total() {
        let slicer = BufferSlicer::new(vec![0; 1024], Default::default());
        let mut stream =
            slicer.create_write_stream(Default::default()).unwrap();
        let mut progress = stream.progress();
        assert_eq!(*progress.borrow(), 0);

        let mut previous = 0;
        for _ in 0..8 {
            stream.write_all(&[1; 100]).await.unwrap();
            assert!(progress.has_changed().unwrap());
            let total = *progress.borrow_and_update();
            assert!(total > previous);
            previous = total;
        }
        assert_eq!(previous, 800);
        assert_eq!(stream.bytes_written(), 800);
    }

    #[tokio::test]
    async fn drop_releases_reference() {
        let slicer = BufferSlicer::new(vec![0; 16], Default::default());
        let mut stream =
            slicer.create_write_stream(Default::default()).unwrap();
        assert_eq!(slicer.ref_count(), 1);

        stream.write_all(b"abc").await.unwrap();
        drop(stream);
        assert_eq!(slicer.ref_count(), 0);
    }

    #[tokio::test]
    async fn failed_write_leaves_position_unchanged() {
        let slicer = FdSlicer::new(DiskFull, Default::default());
        let mut stream =
            slicer.create_write_stream(Default::default()).unwrap();

        let err = stream.write_all(b"abc").await.unwrap_err();
        assert_eq!(err.to_string(), "IO error: disk full");
        assert_eq!(stream.pos(), 0);
        assert_eq!(stream.bytes_written(), 0);
        assert_eq!(*stream.progress().borrow(), 0);
        assert_eq!(slicer.ref_count(), 0);
        assert_eq!(slicer.lock().pending(), 0);

        let err = stream.write_all(b"abc").await.unwrap_err();
        assert_eq!(err.to_string(), "IO error: disk full");
    }

    #[tokio::test]
    async fn shutdown_reports_failed_in_flight_write() {
        let slicer = FdSlicer::new(DiskFull, Default::default());
        let mut stream =
            slicer.create_write_stream(Default::default()).unwrap();

        // Give up on the write while the storage is still busy with it.
        let pending = tokio::time::timeout(
            Duration::from_millis(10),
            stream.write(b"abc"),
        )
        .await;
        assert!(pending.is_err());

        let err = stream.shutdown().await.unwrap_err();
        assert_eq!(err.to_string(), "IO error: disk full");
        assert_eq!(stream.bytes_written(), 0);
        assert_eq!(slicer.ref_count(), 0);

        let err = stream.shutdown().await.unwrap_err();
        assert_eq!(err.to_string(), "IO error: disk full");
    }
}

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::oneshot;

use super::{StreamOptions, Window};
use crate::slicer::{BufResult, Direction, ResourceSlicer};
use crate::{Result, SlicerError};

enum ReadState {
    Idle,
    Reading(oneshot::Receiver<BufResult<usize>>),
    /// A completed read the caller's buffer could not take at once.
    Ready {
        chunk: Vec<u8>,
        offset: usize,
    },
    Ended,
    Failed(SlicerError),
}

/// Represents a readable stream over a window of a [`ResourceSlicer`].
///
/// Every read the stream issues is one physical read, serialized with all
/// other operations on the same slicer. The stream holds one reference on
/// the slicer until it ends, fails or is dropped.
pub struct ReadStream<S: ResourceSlicer> {
    slicer: S,
    window: Window,
    pos: u64,
    state: ReadState,
    destroyed: Arc<AtomicBool>,
    referenced: bool,
}

impl<S: ResourceSlicer> ReadStream<S> {
    pub(crate) fn new(slicer: S, options: StreamOptions) -> Result<Self> {
        let window = Window::new(options.start, options.end)?;
        slicer.add_ref();
        Ok(Self {
            slicer,
            window,
            pos: window.start(),
            state: ReadState::Idle,
            destroyed: Arc::new(AtomicBool::new(false)),
            referenced: true,
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

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Abort the stream. An admitted read still completes, a queued one is
    /// skipped; the slicer reference is released once.
    pub fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::Release);
        if !matches!(self.state, ReadState::Failed(_)) {
            self.state = ReadState::Ended;
        }
        self.unref();
    }

    fn finish(&mut self) {
        log::trace!("read stream ended at {}", self.pos);
        self.state = ReadState::Ended;
        self.unref();
    }

    fn fail(&mut self, err: SlicerError) {
        log::debug!("read stream failed at {}: {err}", self.pos);
        self.state = ReadState::Failed(err);
        self.unref();
    }

    fn unref(&mut self) {
        if std::mem::take(&mut self.referenced) {
            if let Err(err) = self.slicer.unref() {
                log::error!("read stream released its slicer: {err}");
            }
        }
    }
}

impl<S: ResourceSlicer> AsyncRead for ReadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                ReadState::Ended => return Poll::Ready(Ok(())),
                ReadState::Failed(ref err) => {
                    return Poll::Ready(Err(err.clone().into()))
                }
                ReadState::Ready {
                    ref chunk,
                    ref mut offset,
                } => {
                    let count = buf.remaining().min(chunk.len() - *offset);
                    buf.put_slice(&chunk[*offset..*offset + count]);
                    *offset += count;
                    if *offset == chunk.len() {
                        this.state = ReadState::Idle;
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::Idle => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let mut to_read = buf
                        .remaining()
                        .min(this.slicer.max_chunk_size())
                        as u64;
                    if let Some(rest) = this.window.remaining(this.pos) {
                        to_read = to_read.min(rest);
                    }
                    if to_read == 0 {
                        this.finish();
                        return Poll::Ready(Ok(()));
                    }

                    let length = to_read as usize;
                    let (tx, rx) = oneshot::channel();
                    this.slicer.submit(
                        Direction::Read,
                        vec![0; length],
                        0,
                        length,
                        this.pos,
                        Some(this.destroyed.clone()),
                        move |result, chunk| {
                            let _ = tx.send((result, chunk));
                        },
                    );
                    this.state = ReadState::Reading(rx);
                }
                ReadState::Reading(ref mut rx) => {
                    let (result, mut chunk) = ready!(Pin::new(rx).poll(cx))
                        .unwrap_or_else(|_| {
                            (Err(SlicerError::Closed), Vec::new())
                        });
                    match result {
                        Err(err) => {
                            this.fail(err.clone());
                            return Poll::Ready(Err(err.into()));
                        }
                        Ok(0) => {
                            this.finish();
                            return Poll::Ready(Ok(()));
                        }
                        Ok(count) => {
                            this.pos += count as u64;
                            chunk.truncate(count);
                            this.state = ReadState::Ready { chunk, offset: 0 };
                        }
                    }
                }
            }
        }
    }
}

impl<S: ResourceSlicer> Drop for ReadStream<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferSlicer, BufferSlicerOptions};
    use tokio::io::AsyncReadExt;

    const TEXT: &[u8] =
        b"I never conquered rarely came, 16 just held such better days";

    #[tokio::test]
    async fn reads_whole_buffer() {
        let slicer = BufferSlicer::new(TEXT.to_vec(), Default::default());
        let mut stream =
            slicer.create_read_stream(Default::default()).unwrap();
        assert_eq!(slicer.ref_count(), 1);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, TEXT);
        assert_eq!(stream.pos(), TEXT.len() as u64);
        assert_eq!(slicer.ref_count(), 0);
        drop(stream);
        assert_eq!(slicer.ref_count(), 0);
    }

    #[tokio::test]
    async fn respects_window() {
        let slicer = BufferSlicer::new(TEXT.to_vec(), Default::default());
        let mut stream = slicer
            .create_read_stream(StreamOptions::range(2, 17))
            .unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &TEXT[2..17]);
    }

    #[tokio::test]
    async fn chunks_are_capped() {
        let slicer = BufferSlicer::new(
            TEXT.to_vec(),
            BufferSlicerOptions {
                max_chunk_size: Some(7),
            },
        );
        let mut stream =
            slicer.create_read_stream(Default::default()).unwrap();

        let mut buf = [0; 64];
        let count = stream.read(&mut buf).await.unwrap();
        assert_eq!(count, 7);
        assert_eq!(&buf[..7], &TEXT[..7]);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, &TEXT[7..]);
    }

    #[tokio::test]
    async fn small_caller_buffer_gets_the_rest_later() {
        let slicer = BufferSlicer::new(TEXT.to_vec(), Default::default());
        let mut stream = slicer
            .create_read_stream(StreamOptions::range(0, 10))
            .unwrap();

        let mut out = Vec::new();
        let mut buf = [0; 3];
        loop {
            let count = stream.read(&mut buf).await.unwrap();
            if count == 0 {
                break;
            }
            out.extend_from_slice(&buf[..count]);
        }
        assert_eq!(out, &TEXT[..10]);
    }

    #[tokio::test]
    async fn empty_window_ends_at_once() {
        let slicer = BufferSlicer::new(TEXT.to_vec(), Default::default());
        let mut stream = slicer
            .create_read_stream(StreamOptions::range(5, 5))
            .unwrap();

        let mut out = Vec::new();
        assert_eq!(stream.read_to_end(&mut out).await.unwrap(), 0);
        assert_eq!(slicer.ref_count(), 0);
        assert_eq!(slicer.lock().pending(), 0);
    }

    #[tokio::test]
    async fn inverted_window_is_rejected() {
        let slicer = BufferSlicer::new(TEXT.to_vec(), Default::default());
        let err = slicer
            .create_read_stream(StreamOptions::range(10, 5))
            .map(|_| ())
            .unwrap_err();

        assert!(matches!(
            err,
            SlicerError::InvalidWindow { start: 10, end: 5 }
        ));
        assert_eq!(slicer.ref_count(), 0);
    }

    #[tokio::test]
    async fn destroy_releases_reference_once() {
        let slicer = BufferSlicer::new(TEXT.to_vec(), Default::default());
        let mut stream =
            slicer.create_read_stream(Default::default()).unwrap();

        stream.destroy();
        stream.destroy();
        assert!(stream.is_destroyed());
        assert_eq!(slicer.ref_count(), 0);

        let mut out = Vec::new();
        assert_eq!(stream.read_to_end(&mut out).await.unwrap(), 0);
        drop(stream);
        assert_eq!(slicer.ref_count(), 0);
    }

    #[tokio::test]
    async fn queued_read_of_destroyed_stream_is_skipped() {
        let slicer = BufferSlicer::new(TEXT.to_vec(), Default::default());
        let gate = slicer.lock().acquire_owned().await.unwrap();

        let mut stream =
            slicer.create_read_stream(Default::default()).unwrap();
        let mut buf = [0; 8];
        // Issue the read while the gate is held, then abandon it.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            stream.read(&mut buf),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(slicer.lock().queued(), 1);

        stream.destroy();
        gate.release(None).unwrap();

        assert!(slicer.lock().drained().await.is_none());
        assert_eq!(slicer.ref_count(), 0);
    }
}

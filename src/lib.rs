//! Share one file descriptor, or one in-memory buffer, between any number of
//! independent read and write streams.
//!
//! Concurrent positional reads and writes against the same handle race with
//! each other. A slicer funnels every physical operation through a
//! [`Lock`] admitting one operation at a time, while each stream keeps its
//! own `[start, end)` window and cursor. Streams hold a reference on their
//! slicer; with `auto_close` the resource is closed once the last one goes
//! away.
//!
//! ```no_run
//! use fs_slicer::{create_from_fd, FdSlicerOptions, ResourceSlicer, StreamOptions};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn run() -> fs_slicer::Result<()> {
//! let file = std::fs::File::open("blob.bin")?;
//! let slicer = create_from_fd(file, FdSlicerOptions { auto_close: true });
//!
//! let mut head = slicer.create_read_stream(StreamOptions::range(0, 1024))?;
//! let mut tail = slicer.create_read_stream(StreamOptions::default().with_start(1024))?;
//!
//! let (mut a, mut b) = (Vec::new(), Vec::new());
//! let (ra, rb) = tokio::join!(head.read_to_end(&mut a), tail.read_to_end(&mut b));
//! ra?;
//! rb?;
//! # Ok(())
//! # }
//! ```

mod errors;
pub mod lock;
pub mod slicer;
pub mod stream;

pub use errors::{Result, SlicerError};
pub use lock::{Lock, Release};
pub use slicer::{
    BufResult, BufferSlicer, BufferSlicerOptions, FdSlicer, FdSlicerOptions,
    PositionalIo, ResourceSlicer, SlicerState,
};
pub use stream::{ReadStream, StreamOptions, WriteStream};

const KILOBYTE: usize = 1024;

/// Largest single read issued by a stream over an [`FdSlicer`].
pub const DEFAULT_CHUNK_SIZE: usize = 64 * KILOBYTE;

/// Create a new [`BufferSlicer`] from a buffer.
///
/// # Panics
/// When called outside of a Tokio runtime.
pub fn create_from_buffer(
    buffer: Vec<u8>,
    options: BufferSlicerOptions,
) -> BufferSlicer {
    BufferSlicer::new(buffer, options)
}

/// Create a new [`FdSlicer`] from an open handle.
///
/// Open it for reading to use read streams and for writing to use write
/// streams.
///
/// # Panics
/// When called outside of a Tokio runtime.
pub fn create_from_fd<H: PositionalIo>(
    handle: H,
    options: FdSlicerOptions,
) -> FdSlicer<H> {
    FdSlicer::new(handle, options)
}

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
pub(crate) fn initialize() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        log::info!("Initializing fs-slicer tests");
    });
}

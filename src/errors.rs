use std::io;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SlicerError>;

/// Errors produced by the lock, the slicers and their streams.
///
/// The type is `Clone` because the lock keeps a sticky copy of the first
/// error passed to a release while the failing caller still receives its own.
#[derive(Error, Debug, Clone)]
pub enum SlicerError {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
    #[error("maximum file length exceeded")]
    TooBig,
    #[error("cannot unref when refCount equal or lower than 0")]
    InvalidUnref,
    #[error("lock released twice")]
    ReleasedTwice,
    #[error("invalid window: start {start} is past end {end}")]
    InvalidWindow { start: u64, end: u64 },
    #[error("range {offset}..{offset}+{length} is outside a buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        capacity: usize,
    },
    #[error("resource is closed")]
    Closed,
    #[error(transparent)]
    Other(Arc<anyhow::Error>),
}

impl SlicerError {
    /// Stable string code of the condition, e.g. `ETOOBIG`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "EIO",
            Self::TooBig => "ETOOBIG",
            Self::InvalidUnref => "EINVALIDUNREF",
            Self::ReleasedTwice => "ERELEASEDTWICE",
            Self::InvalidWindow { .. } => "EINVALIDWINDOW",
            Self::OutOfBounds { .. } => "ERANGE",
            Self::Closed => "ECLOSED",
            Self::Other(_) => "EOTHER",
        }
    }

    /// Misuse of the lock or reference-count contracts.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::InvalidUnref | Self::ReleasedTwice)
    }
}

impl From<io::Error> for SlicerError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<anyhow::Error> for SlicerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(Arc::new(e))
    }
}

impl From<tokio::task::JoinError> for SlicerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Other(Arc::new(anyhow::anyhow!(
            "physical operation did not complete: {e}"
        )))
    }
}

impl From<SlicerError> for io::Error {
    fn from(e: SlicerError) -> Self {
        let kind = match &e {
            SlicerError::Io(inner) => inner.kind(),
            SlicerError::TooBig => io::ErrorKind::WriteZero,
            SlicerError::InvalidWindow { .. }
            | SlicerError::OutOfBounds { .. } => io::ErrorKind::InvalidInput,
            SlicerError::Closed => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

mod read;
mod write;

use serde::{Deserialize, Serialize};

use crate::{Result, SlicerError};

pub use read::ReadStream;
pub use write::WriteStream;

/// Options to create a [`ReadStream`] or a [`WriteStream`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamOptions {
    /// The offset into the resource to start from.
    pub start: u64,
    /// Exclusive upper bound offset into the resource.
    ///
    /// Read streams without one run until the resource is exhausted. Write
    /// streams without one are bounded by the natural extent of the
    /// resource, if it has any.
    pub end: Option<u64>,
}

impl StreamOptions {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }

    pub fn with_end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }
}

/// The `[start, end)` range a stream may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    start: u64,
    end: Option<u64>,
}

impl Window {
    /// # Errors
    /// [`SlicerError::InvalidWindow`] when `start` lies past `end`.
    pub fn new(start: u64, end: Option<u64>) -> Result<Self> {
        match end {
            Some(end) if start > end => {
                Err(SlicerError::InvalidWindow { start, end })
            }
            _ => Ok(Self { start, end }),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Bytes left between `pos` and the end, `None` when unbounded.
    pub fn remaining(&self, pos: u64) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(pos))
    }

    /// Whether `length` bytes at `pos` stay inside the window.
    pub fn fits(&self, pos: u64, length: u64) -> bool {
        match (self.end, pos.checked_add(length)) {
            (None, _) => true,
            (Some(end), Some(last)) => last <= end,
            (Some(_), None) => false,
        }
    }
}

//! Incremental frame parsers
//!
//! A buffering strategy is fed one socket read at a time and yields the
//! frames that became available. Reads may split a frame anywhere, including
//! inside the header, and one read may complete several frames.
//!
//! Two strategies are provided:
//!
//! - [`StreamingStrategy`] emits a frame as soon as its header is parsed and
//!   forwards the body through a [`BodyStream`](crate::BodyStream). The read
//!   loop awaits [`BufferingStrategy::drain_barrier`] before the next read.
//! - [`BufferedStrategy`] emits a frame only once its whole body has been
//!   received. Required when bodies are compressed.

mod buffered;
mod streaming;

pub use buffered::{BufferedStrategy, DEFAULT_BUFFER_SIZE};
pub use streaming::{STREAM_CHUNK_SIZE, StreamingStrategy};

use serde::{Deserialize, Serialize};

use crate::body::DrainBarrier;
use crate::error::{FrameError, Result};
use crate::frame::Frame;

/// Incremental parser from raw bytes to frames
pub trait BufferingStrategy: Send {
    /// Feed newly read bytes and iterate the frames they complete.
    ///
    /// The iterator parses lazily; frames not pulled before the next call
    /// are still delivered by that call.
    fn process(&mut self, data: &[u8]) -> Frames<'_>;

    /// Append bytes without parsing
    fn feed(&mut self, data: &[u8]);

    /// Parse the next frame out of the fed bytes
    fn next_frame(&mut self) -> Option<Result<Frame>>;

    /// How many bytes the next socket read should ask for
    fn read_hint(&self) -> usize;

    /// Barrier the read loop awaits before its next read, if any
    fn drain_barrier(&self) -> Option<DrainBarrier>;

    /// The byte stream ended. Returns the abort error if a frame was
    /// partially received.
    fn close(&mut self) -> Option<FrameError>;
}

/// Lazy iterator over the frames completed by one [`BufferingStrategy::process`] call
pub struct Frames<'a> {
    strategy: &'a mut dyn BufferingStrategy,
}

impl<'a> Frames<'a> {
    pub fn new(strategy: &'a mut dyn BufferingStrategy) -> Self {
        Self { strategy }
    }
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.strategy.next_frame()
    }
}

/// Strategy selector used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferingMode {
    #[default]
    Streaming,
    Buffered,
}

impl BufferingMode {
    pub fn strategy(self) -> Box<dyn BufferingStrategy> {
        match self {
            Self::Streaming => Box::new(StreamingStrategy::new()),
            Self::Buffered => Box::new(BufferedStrategy::new()),
        }
    }
}

impl std::str::FromStr for BufferingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "streaming" => Ok(Self::Streaming),
            "buffered" => Ok(Self::Buffered),
            other => Err(format!("unknown buffering mode '{other}'")),
        }
    }
}

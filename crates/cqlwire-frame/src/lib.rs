//! Cassandra native protocol frame codec
//!
//! This crate has no I/O. It encodes requests into frames, decodes response
//! frames, and reassembles frames from arbitrary socket reads through the
//! [`BufferingStrategy`] implementations in [`buffering`].
//!
//! ```
//! use cqlwire_frame::{BufferedStrategy, BufferingStrategy, ProtocolVersion, Request};
//!
//! let request = Request::Options.serialize(ProtocolVersion::V2, None).unwrap();
//! assert_eq!(request.as_bytes().len(), 8);
//!
//! let mut strategy = BufferedStrategy::new();
//! assert_eq!(strategy.process(&request.as_bytes()[..4]).count(), 0);
//! assert_eq!(strategy.process(&request.as_bytes()[4..]).count(), 1);
//! ```

pub mod body;
pub mod buffering;
pub mod compression;
pub mod consistency;
pub mod error;
pub mod event;
pub mod frame;
pub mod header;
pub mod primitives;
pub mod request;
pub mod response;
pub mod server_error;

pub use body::{BodyStream, DrainBarrier};
pub use buffering::{
    BufferedStrategy, BufferingMode, BufferingStrategy, Frames, StreamingStrategy,
};
pub use compression::{Compressor, Lz4Compressor};
pub use consistency::Consistency;
pub use error::{FrameError, Result};
pub use event::{Event, EventType, SchemaChangeKind, StatusChange, TopologyChange};
pub use frame::{Frame, FrameBody, FrameWriter, SerializedRequest};
pub use header::{
    EVENT_STREAM_ID, FrameFlags, FrameHeader, HEADER_LEN, MAX_BODY_LEN, MAX_FRAME_LEN,
    MAX_STREAMS, Opcode, ProtocolVersion,
};
pub use request::{BatchStatement, BatchType, QueryParameters, Request};
pub use response::{Response, ResultBody, Rows};
pub use server_error::{ServerError, ServerErrorKind, WriteType};

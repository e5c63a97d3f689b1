//! Error types for frame encoding and decoding

use thiserror::Error;

use crate::header::Opcode;

/// Errors raised while encoding or decoding protocol frames.
///
/// Every variant is a protocol-level violation or a local encoding limit.
/// A violation on the read path means the byte stream can no longer be
/// trusted, so the owning connection treats it as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Declared body length is above the frame ceiling
    #[error("Frame body length {length} exceeds the maximum of {max} bytes")]
    BodyTooLarge {
        /// Length found in the header or produced by the encoder
        length: u64,
        /// Maximum allowed body length
        max: usize,
    },

    /// Declared body length is negative
    #[error("Negative frame body length: {0}")]
    NegativeBodyLength(i32),

    /// Opcode byte does not name a known operation
    #[error("Unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Frame opcode is valid but not acceptable where it appeared
    #[error("Unexpected {0:?} frame")]
    UnexpectedOpcode(Opcode),

    /// Protocol version byte is not supported
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Request cannot be expressed in the negotiated protocol version
    #[error("{opcode:?} requests require protocol version {required} or later")]
    UnsupportedRequest {
        /// Opcode of the offending request
        opcode: Opcode,
        /// Minimum protocol version for the request
        required: u8,
    },

    /// Not enough bytes left in the body to decode a value
    #[error("Truncated body: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the value being decoded
        needed: usize,
        /// Bytes left in the body
        available: usize,
    },

    /// Address length in an `[inet]` is neither 4 nor 16
    #[error("Invalid inet address length {0}")]
    InvalidInetLength(u8),

    /// Port in an `[inet]` is outside the u16 range
    #[error("Invalid inet port {0}")]
    InvalidPort(i32),

    /// String payload is not valid UTF-8
    #[error("Invalid UTF-8 in string value")]
    InvalidUtf8,

    /// Length prefix of a collection or string is negative
    #[error("Invalid negative length {0}")]
    NegativeLength(i32),

    /// Value is too long for its length prefix
    #[error("{kind} value of {length} bytes does not fit its length prefix")]
    ValueTooLong {
        /// Primitive being encoded
        kind: &'static str,
        /// Offending length
        length: usize,
    },

    /// Consistency code is not known
    #[error("Unknown consistency level 0x{0:04x}")]
    UnknownConsistency(u16),

    /// RESULT kind is not known
    #[error("Unknown result kind {0}")]
    UnknownResultKind(i32),

    /// EVENT type or change kind is not known
    #[error("Unknown event '{0}'")]
    UnknownEvent(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// A compressed frame arrived on a connection without a codec
    #[error("Compressed frame received but no compressor is configured")]
    MissingCompressor,

    /// The stream closed before a frame body was complete
    #[error("Frame body aborted after {received} of {expected} bytes")]
    BodyAborted {
        /// Bytes received before the abort
        received: usize,
        /// Declared body length
        expected: usize,
    },
}

pub type Result<T> = std::result::Result<T, FrameError>;

//! Fixed 8-byte frame header
//!
//! ```text
//! byte 0     version (high bit set on responses)
//! byte 1     flags
//! byte 2     stream id (signed, -1 reserved for server events)
//! byte 3     opcode
//! bytes 4-7  body length (big-endian i32)
//! ```

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Size of the frame header on the wire
pub const HEADER_LEN: usize = 8;

/// Largest frame (header included) accepted in either direction
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Largest body a frame may declare
pub const MAX_BODY_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Stream id used by the server for pushed events
pub const EVENT_STREAM_ID: i16 = -1;

/// Number of request stream ids available on one connection
pub const MAX_STREAMS: usize = 128;

const RESPONSE_DIRECTION: u8 = 0x80;

/// Native protocol version spoken on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    /// Version byte written on request frames
    pub const fn request_byte(self) -> u8 {
        self as u8
    }

    /// Version byte the server writes on response frames
    pub const fn response_byte(self) -> u8 {
        self as u8 | RESPONSE_DIRECTION
    }

    /// Parse a version byte, ignoring the direction bit
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte & !RESPONSE_DIRECTION {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            _ => Err(FrameError::UnsupportedVersion(byte)),
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V2
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Header flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const COMPRESSION: Self = Self(0x01);
    pub const TRACING: Self = Self(0x02);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// Frame operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Credentials = 0x04,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        let opcode = match value {
            0x00 => Self::Error,
            0x01 => Self::Startup,
            0x02 => Self::Ready,
            0x03 => Self::Authenticate,
            0x04 => Self::Credentials,
            0x05 => Self::Options,
            0x06 => Self::Supported,
            0x07 => Self::Query,
            0x08 => Self::Result,
            0x09 => Self::Prepare,
            0x0A => Self::Execute,
            0x0B => Self::Register,
            0x0C => Self::Event,
            0x0D => Self::Batch,
            0x0E => Self::AuthChallenge,
            0x0F => Self::AuthResponse,
            0x10 => Self::AuthSuccess,
            other => return Err(FrameError::UnknownOpcode(other)),
        };
        Ok(opcode)
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw version byte, direction bit included
    pub version: u8,
    pub flags: FrameFlags,
    pub stream_id: i16,
    pub opcode: Opcode,
    pub body_len: usize,
}

impl FrameHeader {
    /// Whether the version byte marks a server-to-client frame
    pub const fn is_response(&self) -> bool {
        self.version & RESPONSE_DIRECTION != 0
    }

    /// Whether this frame carries a server-pushed event
    pub const fn is_event(&self) -> bool {
        self.stream_id == EVENT_STREAM_ID
    }

    pub const fn is_compressed(&self) -> bool {
        self.flags.contains(FrameFlags::COMPRESSION)
    }

    /// Write the header as 8 bytes
    pub fn encode<B: BufMut>(&self, dst: &mut B) -> Result<()> {
        if self.body_len > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                length: self.body_len as u64,
                max: MAX_BODY_LEN,
            });
        }
        dst.put_u8(self.version);
        dst.put_u8(self.flags.bits());
        dst.put_i8(self.stream_id as i8);
        dst.put_u8(self.opcode as u8);
        dst.put_i32(self.body_len as i32);
        Ok(())
    }

    /// Decode a header, rejecting out-of-range lengths before any body
    /// buffer is sized from them.
    pub fn decode(src: &[u8; HEADER_LEN]) -> Result<Self> {
        let length = i32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        if length < 0 {
            return Err(FrameError::NegativeBodyLength(length));
        }
        let body_len = length as usize;
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                length: body_len as u64,
                max: MAX_BODY_LEN,
            });
        }

        Ok(Self {
            version: src[0],
            flags: FrameFlags::from_bits(src[1]),
            stream_id: i16::from(src[2] as i8),
            opcode: Opcode::try_from(src[3])?,
            body_len,
        })
    }
}

//! Whole frames and the frame writer

use bytes::{Bytes, BytesMut};

use crate::body::BodyStream;
use crate::compression::Compressor;
use crate::error::{FrameError, Result};
use crate::header::{FrameFlags, FrameHeader, HEADER_LEN, MAX_BODY_LEN, Opcode};

/// Body of a decoded frame
#[derive(Debug)]
pub enum FrameBody {
    /// Fully received body
    Buffered(Bytes),
    /// Body still arriving from the socket
    Streaming(BodyStream),
}

impl FrameBody {
    /// Wait for the complete body
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            Self::Buffered(bytes) => Ok(bytes),
            Self::Streaming(stream) => stream.collect().await,
        }
    }
}

/// One protocol message as produced by a buffering strategy
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl Frame {
    pub fn buffered(header: FrameHeader, body: Bytes) -> Self {
        Self {
            header,
            body: FrameBody::Buffered(body),
        }
    }

    pub const fn stream_id(&self) -> i16 {
        self.header.stream_id
    }

    pub const fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Collect the body and undo body compression.
    ///
    /// A compressed frame without a codec is a protocol violation.
    pub async fn into_body(
        self,
        compressor: Option<&dyn Compressor>,
    ) -> Result<(FrameHeader, Bytes)> {
        let header = self.header;
        let body = self.body.collect().await?;
        if !header.is_compressed() {
            return Ok((header, body));
        }
        let codec = compressor.ok_or(FrameError::MissingCompressor)?;
        Ok((header, codec.decompress(&body)?))
    }
}

/// Builds one outgoing frame.
///
/// The header is reserved up front and patched in [`FrameWriter::finish`]
/// once the body length is known.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
    version: u8,
    flags: FrameFlags,
    stream_id: i16,
    opcode: Opcode,
}

impl FrameWriter {
    pub fn new(version: u8, stream_id: i16, opcode: Opcode) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.resize(HEADER_LEN, 0);
        Self {
            buf,
            version,
            flags: FrameFlags::empty(),
            stream_id,
            opcode,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Body buffer; everything written lands after the reserved header
    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn body_len(&self) -> usize {
        self.buf.len() - HEADER_LEN
    }

    /// Optionally compress the body, then patch the header in place.
    pub fn finish(mut self, compressor: Option<&dyn Compressor>) -> Result<BytesMut> {
        if let Some(codec) = compressor {
            let compressed = codec.compress(&self.buf[HEADER_LEN..])?;
            self.buf.truncate(HEADER_LEN);
            self.buf.extend_from_slice(&compressed);
            self.flags.insert(FrameFlags::COMPRESSION);
        }

        let body_len = self.body_len();
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                length: body_len as u64,
                max: MAX_BODY_LEN,
            });
        }

        let header = FrameHeader {
            version: self.version,
            flags: self.flags,
            stream_id: self.stream_id,
            opcode: self.opcode,
            body_len,
        };
        let mut head = &mut self.buf[..HEADER_LEN];
        header.encode(&mut head)?;
        Ok(self.buf)
    }
}

/// A fully encoded request awaiting its stream id.
///
/// Serialization happens before a stream id is allocated so an encoding
/// failure never consumes one.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    buf: BytesMut,
    opcode: Opcode,
}

impl SerializedRequest {
    pub(crate) fn new(buf: BytesMut, opcode: Opcode) -> Self {
        Self { buf, opcode }
    }

    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn stream_id(&self) -> i16 {
        i16::from(self.buf[2] as i8)
    }

    /// Stamp the stream id into the encoded header
    pub fn set_stream(&mut self, stream_id: i16) {
        self.buf[2] = stream_id as i8 as u8;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

//! Whole-frame parser

use bytes::{Buf, BytesMut};

use super::{BufferingStrategy, Frames};
use crate::body::DrainBarrier;
use crate::error::{FrameError, Result};
use crate::frame::Frame;
use crate::header::{FrameHeader, HEADER_LEN};

/// Socket read size used by the buffered strategy
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Emits frames only once their whole body is in memory.
#[derive(Debug)]
pub struct BufferedStrategy {
    pending: BytesMut,
    header: Option<FrameHeader>,
    body: BytesMut,
    buffer_size: usize,
    failed: bool,
}

impl BufferedStrategy {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            header: None,
            body: BytesMut::new(),
            buffer_size: buffer_size.max(HEADER_LEN),
            failed: false,
        }
    }
}

impl Default for BufferedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferingStrategy for BufferedStrategy {
    fn process(&mut self, data: &[u8]) -> Frames<'_> {
        self.feed(data);
        Frames::new(self)
    }

    fn feed(&mut self, data: &[u8]) {
        if !self.failed {
            self.pending.extend_from_slice(data);
        }
    }

    fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.failed {
            return None;
        }
        loop {
            let Some(header) = self.header else {
                if self.pending.len() < HEADER_LEN {
                    return None;
                }
                let mut raw = [0u8; HEADER_LEN];
                self.pending.copy_to_slice(&mut raw);
                match FrameHeader::decode(&raw) {
                    Ok(header) if header.body_len == 0 => {
                        return Some(Ok(Frame::buffered(header, bytes::Bytes::new())));
                    }
                    Ok(header) => {
                        self.header = Some(header);
                        continue;
                    }
                    Err(e) => {
                        self.failed = true;
                        self.pending.clear();
                        return Some(Err(e));
                    }
                }
            };

            // Whole body already read: hand it over without copying
            if self.body.is_empty() && self.pending.len() >= header.body_len {
                let body = self.pending.split_to(header.body_len).freeze();
                self.header = None;
                return Some(Ok(Frame::buffered(header, body)));
            }

            if self.body.capacity() == 0 {
                self.body.reserve(header.body_len);
            }
            let n = (header.body_len - self.body.len()).min(self.pending.len());
            if n == 0 {
                return None;
            }
            self.body.extend_from_slice(&self.pending.split_to(n));
            if self.body.len() == header.body_len {
                let body = std::mem::take(&mut self.body).freeze();
                self.header = None;
                return Some(Ok(Frame::buffered(header, body)));
            }
        }
    }

    fn read_hint(&self) -> usize {
        self.buffer_size
    }

    fn drain_barrier(&self) -> Option<DrainBarrier> {
        None
    }

    fn close(&mut self) -> Option<FrameError> {
        self.failed = true;
        let aborted = match self.header.take() {
            Some(header) => Some(FrameError::BodyAborted {
                received: self.body.len() + self.pending.len(),
                expected: header.body_len,
            }),
            None if !self.pending.is_empty() => Some(FrameError::Truncated {
                needed: HEADER_LEN,
                available: self.pending.len(),
            }),
            None => None,
        };
        self.body = BytesMut::new();
        self.pending.clear();
        aborted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::frame::{FrameBody, FrameWriter};
    use crate::header::Opcode;

    fn encoded(stream_id: i16, body: &[u8]) -> BytesMut {
        let mut writer = FrameWriter::new(0x82, stream_id, Opcode::Result);
        writer.body_mut().extend_from_slice(body);
        writer.finish(None).unwrap()
    }

    fn body_of(frame: &Frame) -> &[u8] {
        match &frame.body {
            FrameBody::Buffered(bytes) => bytes,
            FrameBody::Streaming(_) => panic!("buffered strategy produced a streaming body"),
        }
    }

    #[test]
    fn test_frame_waits_for_full_body() {
        let wire = encoded(5, b"hello world");
        let mut strategy = BufferedStrategy::new();

        assert_eq!(strategy.process(&wire[..3]).count(), 0);
        assert_eq!(strategy.process(&wire[3..12]).count(), 0);
        let frames: Vec<_> = strategy
            .process(&wire[12..])
            .map(|f| f.expect("valid frame"))
            .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id(), 5);
        assert_eq!(body_of(&frames[0]), b"hello world");
    }

    #[test]
    fn test_many_frames_and_remainder() {
        let mut wire = encoded(1, b"one");
        wire.extend_from_slice(&encoded(2, b""));
        wire.extend_from_slice(&encoded(3, b"three"));
        let split = wire.len() - 2;

        let mut strategy = BufferedStrategy::new();
        let first: Vec<_> = strategy
            .process(&wire[..split])
            .map(|f| f.expect("valid frame"))
            .collect();
        assert_eq!(first.len(), 2);
        assert_eq!(body_of(&first[0]), b"one");
        assert!(body_of(&first[1]).is_empty());

        let rest: Vec<_> = strategy
            .process(&wire[split..])
            .map(|f| f.expect("valid frame"))
            .collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(body_of(&rest[0]), b"three");
    }

    #[test]
    fn test_close_reports_partial_frame() {
        let wire = encoded(9, &[0u8; 32]);
        let mut strategy = BufferedStrategy::new();
        assert_eq!(strategy.process(&wire[..20]).count(), 0);
        assert_eq!(
            strategy.close(),
            Some(FrameError::BodyAborted {
                received: 12,
                expected: 32
            })
        );
        assert_eq!(strategy.process(&wire[20..]).count(), 0);
    }

    #[test]
    fn test_read_hint() {
        assert_eq!(BufferedStrategy::new().read_hint(), DEFAULT_BUFFER_SIZE);
        assert_eq!(BufferedStrategy::with_buffer_size(2).read_hint(), HEADER_LEN);
        assert!(BufferedStrategy::new().drain_barrier().is_none());
    }
}

//! Header-then-stream frame parser

use std::sync::Arc;

use bytes::{Buf, BytesMut};

use super::{BufferingStrategy, Frames};
use crate::body::{BodySink, DrainBarrier, DrainState, body_channel};
use crate::error::{FrameError, Result};
use crate::frame::{Frame, FrameBody};
use crate::header::{FrameHeader, HEADER_LEN};

/// Largest body chunk requested from the socket in one read
pub const STREAM_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug)]
enum State {
    Header {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    Body {
        sink: BodySink,
        expected: usize,
        remaining: usize,
    },
    Failed,
}

impl State {
    const fn header() -> Self {
        Self::Header {
            buf: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

/// Emits each frame right after its header and streams the body.
#[derive(Debug)]
pub struct StreamingStrategy {
    pending: BytesMut,
    state: State,
    drain: Arc<DrainState>,
}

impl StreamingStrategy {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::with_capacity(HEADER_LEN),
            state: State::header(),
            drain: Arc::new(DrainState::default()),
        }
    }
}

impl Default for StreamingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferingStrategy for StreamingStrategy {
    fn process(&mut self, data: &[u8]) -> Frames<'_> {
        self.feed(data);
        Frames::new(self)
    }

    fn feed(&mut self, data: &[u8]) {
        if !matches!(self.state, State::Failed) {
            self.pending.extend_from_slice(data);
        }
    }

    fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            if self.pending.is_empty() {
                return None;
            }
            match &mut self.state {
                State::Failed => return None,
                State::Header { buf, filled } => {
                    while *filled < HEADER_LEN && self.pending.has_remaining() {
                        buf[*filled] = self.pending.get_u8();
                        *filled += 1;
                    }
                    if *filled < HEADER_LEN {
                        return None;
                    }

                    let header = match FrameHeader::decode(buf) {
                        Ok(header) => header,
                        Err(e) => {
                            self.state = State::Failed;
                            self.pending.clear();
                            return Some(Err(e));
                        }
                    };
                    let (sink, stream) = body_channel(header.body_len, &self.drain);
                    self.state = if header.body_len == 0 {
                        State::header()
                    } else {
                        State::Body {
                            sink,
                            expected: header.body_len,
                            remaining: header.body_len,
                        }
                    };
                    return Some(Ok(Frame {
                        header,
                        body: FrameBody::Streaming(stream),
                    }));
                }
                State::Body {
                    sink, remaining, ..
                } => {
                    let n = (*remaining).min(self.pending.len());
                    sink.send(self.pending.split_to(n).freeze());
                    *remaining -= n;
                    if *remaining == 0 {
                        self.state = State::header();
                    }
                }
            }
        }
    }

    fn read_hint(&self) -> usize {
        match &self.state {
            State::Header { filled, .. } => HEADER_LEN - filled,
            State::Body { remaining, .. } => (*remaining).min(STREAM_CHUNK_SIZE),
            State::Failed => HEADER_LEN,
        }
    }

    fn drain_barrier(&self) -> Option<DrainBarrier> {
        Some(DrainBarrier::new(Arc::clone(&self.drain)))
    }

    fn close(&mut self) -> Option<FrameError> {
        let state = std::mem::replace(&mut self.state, State::Failed);
        let aborted = match state {
            State::Body {
                sink,
                expected,
                mut remaining,
            } => {
                // Bytes already read but not yet forwarded still belong to the body
                let n = remaining.min(self.pending.len());
                if n > 0 {
                    sink.send(self.pending.split_to(n).freeze());
                    remaining -= n;
                }
                sink.abort();
                Some(FrameError::BodyAborted {
                    received: expected - remaining,
                    expected,
                })
            }
            State::Header { filled, .. } if filled > 0 => Some(FrameError::Truncated {
                needed: HEADER_LEN,
                available: filled,
            }),
            _ => None,
        };
        self.pending.clear();
        aborted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::frame::FrameWriter;
    use crate::header::Opcode;
    use bytes::Bytes;

    fn encoded(stream_id: i16, body: &[u8]) -> BytesMut {
        let mut writer = FrameWriter::new(0x82, stream_id, Opcode::Result);
        writer.body_mut().extend_from_slice(body);
        writer.finish(None).unwrap()
    }

    #[tokio::test]
    async fn test_frame_emitted_before_body() {
        let wire = encoded(3, b"0123456789");
        let mut strategy = StreamingStrategy::new();

        let mut frames: Vec<_> = strategy.process(&wire[..HEADER_LEN + 4]).collect();
        assert_eq!(frames.len(), 1);
        let frame = frames.pop().unwrap().unwrap();
        assert_eq!(frame.stream_id(), 3);
        assert_eq!(strategy.read_hint(), 6);

        assert_eq!(strategy.process(&wire[HEADER_LEN + 4..]).count(), 0);
        assert_eq!(strategy.read_hint(), HEADER_LEN);

        let body = frame.body.collect().await.unwrap();
        assert_eq!(body, Bytes::from_static(b"0123456789"));
    }

    #[tokio::test]
    async fn test_many_frames_in_one_read() {
        let mut wire = encoded(1, b"a");
        wire.extend_from_slice(&encoded(2, b""));
        wire.extend_from_slice(&encoded(3, b"ccc"));
        wire.extend_from_slice(&encoded(4, b"dd")[..5]);

        let mut strategy = StreamingStrategy::new();
        let frames: Vec<_> = strategy
            .process(&wire)
            .map(|f| f.expect("valid frame"))
            .collect();
        assert_eq!(
            frames.iter().map(Frame::stream_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(strategy.read_hint(), HEADER_LEN - 5);
    }

    #[tokio::test]
    async fn test_close_aborts_partial_body() {
        let wire = encoded(7, b"abcdef");
        let mut strategy = StreamingStrategy::new();
        let frame = strategy
            .process(&wire[..HEADER_LEN + 2])
            .next()
            .unwrap()
            .unwrap();

        assert_eq!(
            strategy.close(),
            Some(FrameError::BodyAborted {
                received: 2,
                expected: 6
            })
        );
        assert_eq!(
            frame.body.collect().await,
            Err(FrameError::BodyAborted {
                received: 2,
                expected: 6
            })
        );
    }

    #[test]
    fn test_bad_header_poisons_strategy() {
        let mut strategy = StreamingStrategy::new();
        let mut frames = strategy.process(&[0x82, 0, 1, 0x08, 0x7F, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            frames.next(),
            Some(Err(FrameError::BodyTooLarge { .. }))
        ));
        assert!(frames.next().is_none());
        assert_eq!(strategy.process(&encoded(1, b"")).count(), 0);
    }
}

//! Chunking invariance of the buffering strategies.
//!
//! However the byte stream is split into reads, both strategies must emit
//! the same frames in the same order with the same bodies.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use cqlwire_frame::{
    BufferedStrategy, BufferingStrategy, Frame, FrameWriter, Opcode, StreamingStrategy,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Emitted {
    stream_id: i16,
    opcode: Opcode,
    body: Bytes,
}

fn encode(frames: &[(i16, Vec<u8>)]) -> BytesMut {
    let mut wire = BytesMut::new();
    for (stream_id, body) in frames {
        let opcode = if *stream_id < 0 {
            Opcode::Event
        } else {
            Opcode::Result
        };
        let mut writer = FrameWriter::new(0x82, *stream_id, opcode);
        writer.body_mut().extend_from_slice(body);
        wire.extend_from_slice(&writer.finish(None).expect("frame encodes"));
    }
    wire
}

/// Split `wire` at the given cut points
fn chunks(wire: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (wire.len() + 1)).collect();
    points.push(0);
    points.push(wire.len());
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|w| wire[w[0]..w[1]].to_vec()).collect()
}

fn run(strategy: &mut dyn BufferingStrategy, reads: &[Vec<u8>]) -> Vec<Emitted> {
    let mut frames: Vec<Frame> = Vec::new();
    for read in reads {
        for frame in strategy.process(read) {
            frames.push(frame.expect("valid frame"));
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime builds");
    runtime.block_on(async move {
        let mut emitted = Vec::with_capacity(frames.len());
        for frame in frames {
            let stream_id = frame.stream_id();
            let opcode = frame.opcode();
            let body = frame.body.collect().await.expect("body completes");
            emitted.push(Emitted {
                stream_id,
                opcode,
                body,
            });
        }
        emitted
    })
}

fn frame_specs() -> impl Strategy<Value = Vec<(i16, Vec<u8>)>> {
    prop::collection::vec(
        (
            prop_oneof![Just(-1i16), 0i16..128],
            prop::collection::vec(any::<u8>(), 0..600),
        ),
        1..12,
    )
}

proptest! {
    #[test]
    fn buffered_output_independent_of_chunking(
        specs in frame_specs(),
        cuts in prop::collection::vec(any::<usize>(), 0..40),
    ) {
        let wire = encode(&specs);
        let whole = run(&mut BufferedStrategy::new(), &[wire.to_vec()]);
        let chunked = run(&mut BufferedStrategy::new(), &chunks(&wire, &cuts));

        prop_assert_eq!(whole.len(), specs.len());
        prop_assert_eq!(&whole, &chunked);
        for (emitted, (stream_id, body)) in whole.iter().zip(&specs) {
            prop_assert_eq!(emitted.stream_id, *stream_id);
            prop_assert_eq!(&emitted.body[..], &body[..]);
        }
    }

    #[test]
    fn streaming_output_independent_of_chunking(
        specs in frame_specs(),
        cuts in prop::collection::vec(any::<usize>(), 0..40),
    ) {
        let wire = encode(&specs);
        let whole = run(&mut StreamingStrategy::new(), &[wire.to_vec()]);
        let chunked = run(&mut StreamingStrategy::new(), &chunks(&wire, &cuts));

        prop_assert_eq!(&whole, &chunked);
        let buffered = run(&mut BufferedStrategy::new(), &[wire.to_vec()]);
        prop_assert_eq!(&whole, &buffered);
    }

    #[test]
    fn byte_at_a_time_matches_whole(specs in frame_specs()) {
        let wire = encode(&specs);
        let bytes: Vec<Vec<u8>> = wire.iter().map(|b| vec![*b]).collect();

        for strategy in [
            Box::new(StreamingStrategy::new()) as Box<dyn BufferingStrategy>,
            Box::new(BufferedStrategy::new()),
        ] {
            let mut strategy = strategy;
            let emitted = run(strategy.as_mut(), &bytes);
            let expected = run(&mut BufferedStrategy::new(), &[wire.to_vec()]);
            if emitted != expected {
                return Err(TestCaseError::fail("byte-at-a-time output differs"));
            }
        }
    }
}

#[test]
fn event_frames_keep_signed_stream_id() {
    let wire = encode(&[(-1, b"evt".to_vec()), (127, Vec::new())]);
    let emitted = run(&mut StreamingStrategy::new(), &[wire.to_vec()]);
    assert_eq!(emitted[0].stream_id, -1);
    assert_eq!(emitted[0].opcode, Opcode::Event);
    assert_eq!(emitted[1].stream_id, 127);
    assert!(emitted[1].body.is_empty());
}

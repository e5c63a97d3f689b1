//! Streamed frame bodies and the drain barrier
//!
//! The streaming strategy emits a frame as soon as its header is parsed and
//! forwards body bytes to a [`BodyStream`] as they arrive. The read loop must
//! not pull more bytes off the socket until the consumer has taken what was
//! already forwarded; [`DrainBarrier`] is the handshake for that.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, mpsc};

use crate::error::{FrameError, Result};

#[derive(Debug)]
pub(crate) enum BodyChunk {
    Data(Bytes),
    Aborted,
}

/// Bytes forwarded to body streams but not yet consumed
#[derive(Debug, Default)]
pub(crate) struct DrainState {
    queued: AtomicUsize,
    notify: Notify,
}

impl DrainState {
    fn add(&self, n: usize) {
        self.queued.fetch_add(n, Ordering::AcqRel);
    }

    fn sub(&self, n: usize) {
        if n == 0 {
            return;
        }
        if self.queued.fetch_sub(n, Ordering::AcqRel) == n {
            self.notify.notify_waiters();
        }
    }
}

/// Sending half owned by the streaming strategy
#[derive(Debug)]
pub(crate) struct BodySink {
    tx: mpsc::UnboundedSender<BodyChunk>,
    drain: Arc<DrainState>,
}

impl BodySink {
    /// Forward a chunk. Chunks for a dropped stream are discarded.
    pub(crate) fn send(&self, chunk: Bytes) {
        let len = chunk.len();
        self.drain.add(len);
        if self.tx.send(BodyChunk::Data(chunk)).is_err() {
            self.drain.sub(len);
        }
    }

    pub(crate) fn abort(&self) {
        let _ = self.tx.send(BodyChunk::Aborted);
    }
}

pub(crate) fn body_channel(expected: usize, drain: &Arc<DrainState>) -> (BodySink, BodyStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = BodySink {
        tx,
        drain: Arc::clone(drain),
    };
    let stream = BodyStream {
        rx,
        expected,
        received: 0,
        drain: Arc::clone(drain),
    };
    (sink, stream)
}

/// Frame body delivered incrementally from the socket
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::UnboundedReceiver<BodyChunk>,
    expected: usize,
    received: usize,
    drain: Arc<DrainState>,
}

impl BodyStream {
    /// Declared body length
    pub fn len(&self) -> usize {
        self.expected
    }

    pub fn is_empty(&self) -> bool {
        self.expected == 0
    }

    /// Bytes taken from the stream so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Next chunk of the body, `None` once the declared length was read.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if self.received >= self.expected {
            return None;
        }
        let aborted = FrameError::BodyAborted {
            received: self.received,
            expected: self.expected,
        };
        match self.rx.recv().await {
            Some(BodyChunk::Data(chunk)) => {
                self.received += chunk.len();
                self.drain.sub(chunk.len());
                Some(Ok(chunk))
            }
            Some(BodyChunk::Aborted) | None => Some(Err(aborted)),
        }
    }

    /// Read the rest of the body into one contiguous buffer
    pub async fn collect(mut self) -> Result<Bytes> {
        let first = match self.next_chunk().await {
            None => return Ok(Bytes::new()),
            Some(chunk) => chunk?,
        };
        if first.len() == self.expected {
            return Ok(first);
        }
        let mut body = BytesMut::with_capacity(self.expected);
        body.extend_from_slice(&first);
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        self.rx.close();
        let mut released = 0;
        while let Ok(chunk) = self.rx.try_recv() {
            if let BodyChunk::Data(data) = chunk {
                released += data.len();
            }
        }
        self.drain.sub(released);
    }
}

/// Future source the read loop awaits before re-arming a socket read
#[derive(Debug, Clone)]
pub struct DrainBarrier {
    state: Arc<DrainState>,
}

impl DrainBarrier {
    pub(crate) fn new(state: Arc<DrainState>) -> Self {
        Self { state }
    }

    /// Bytes forwarded to consumers and not yet taken
    pub fn queued(&self) -> usize {
        self.state.queued.load(Ordering::Acquire)
    }

    /// Resolve once every forwarded body byte has been consumed or dropped
    pub async fn wait(&self) {
        loop {
            let mut notified = pin!(self.state.notify.notified());
            notified.as_mut().enable();
            if self.queued() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collect_across_chunks() {
        let drain = Arc::new(DrainState::default());
        let (sink, stream) = body_channel(6, &drain);
        sink.send(Bytes::from_static(b"abc"));
        sink.send(Bytes::from_static(b"def"));
        assert_eq!(stream.collect().await.unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(drain.queued.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_abort_reports_progress() {
        let drain = Arc::new(DrainState::default());
        let (sink, stream) = body_channel(10, &drain);
        sink.send(Bytes::from_static(b"abcd"));
        sink.abort();
        assert_eq!(
            stream.collect().await,
            Err(FrameError::BodyAborted {
                received: 4,
                expected: 10
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_barrier() {
        let drain = Arc::new(DrainState::default());
        let barrier = DrainBarrier::new(Arc::clone(&drain));
        let (sink, stream) = body_channel(8, &drain);
        sink.send(Bytes::from_static(b"1234"));
        assert_eq!(barrier.queued(), 4);

        drop(stream);
        assert_eq!(barrier.queued(), 0);
        sink.send(Bytes::from_static(b"5678"));
        assert_eq!(barrier.queued(), 0);

        tokio::time::timeout(Duration::from_secs(1), barrier.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_barrier_waits_for_consumer() {
        let drain = Arc::new(DrainState::default());
        let barrier = DrainBarrier::new(Arc::clone(&drain));
        let (sink, mut stream) = body_channel(4, &drain);
        sink.send(Bytes::from_static(b"wxyz"));

        let waiter = tokio::spawn({
            let barrier = barrier.clone();
            async move { barrier.wait().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"wxyz");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

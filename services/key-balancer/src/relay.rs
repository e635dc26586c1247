//! Incremental line relay for server-sent event responses
//!
//! Upstream chunks are re-cut on `\n` boundaries and every complete line is
//! yielded as its own body frame, so hyper writes it to the client as soon as
//! it is read. A line is forwarded including its terminator.
//!
//! The relay owns the upstream body stream and the in-flight guard. Dropping
//! the response body (client gone, or stream finished) drops both, which
//! closes the upstream connection and releases the in-flight slot.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use tracing::{debug, warn};

use crate::metrics;
use crate::proxy::InFlightGuard;

struct LineRelay<S> {
    upstream: Pin<Box<S>>,
    buf: BytesMut,
    finished: bool,
    lines: u64,
    _guard: InFlightGuard,
}

impl<S> LineRelay<S> {
    /// Split off the next complete line, if the buffer holds one.
    fn next_line(&mut self) -> Option<Bytes> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        self.lines += 1;
        Some(self.buf.split_to(end + 1).freeze())
    }
}

/// Turn an upstream byte stream into a stream of single lines.
///
/// At a clean end of stream any unterminated remainder is sent as a final
/// frame. A read error is logged and ends the relay; the partial line buffered
/// at that point is discarded. The relay never yields an error, since the
/// response status is already on the wire.
pub fn line_stream<S, E>(
    upstream: S,
    guard: InFlightGuard,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let relay = LineRelay {
        upstream: Box::pin(upstream),
        buf: BytesMut::new(),
        finished: false,
        lines: 0,
        _guard: guard,
    };

    futures_util::stream::unfold(relay, |mut relay| async move {
        loop {
            if let Some(line) = relay.next_line() {
                return Some((Ok(line), relay));
            }
            if relay.finished {
                if relay.buf.is_empty() {
                    debug!(lines = relay.lines, "stream relay finished");
                    return None;
                }
                let rest = relay.buf.split().freeze();
                return Some((Ok(rest), relay));
            }
            match relay.upstream.next().await {
                Some(Ok(chunk)) => relay.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    warn!(
                        error = %e,
                        lines = relay.lines,
                        discarded_bytes = relay.buf.len(),
                        "error reading upstream stream, ending relay"
                    );
                    metrics::record_upstream_error("body");
                    relay.buf.clear();
                    relay.finished = true;
                }
                None => relay.finished = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, io::Error>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    async fn relay_all(input: Vec<Result<Bytes, io::Error>>) -> Vec<Bytes> {
        let guard = InFlightGuard::new(Arc::new(AtomicU64::new(0)));
        line_stream(futures_util::stream::iter(input), guard)
            .map(|frame| match frame {
                Ok(bytes) => bytes,
                Err(never) => match never {},
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn lines_are_recut_across_chunk_boundaries() {
        let frames = relay_all(chunks(&["data: {\"a\":1}\n\nda", "ta: [DO", "NE]\n\n"])).await;
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"data: {\"a\":1}\n"),
                Bytes::from_static(b"\n"),
                Bytes::from_static(b"data: [DONE]\n"),
                Bytes::from_static(b"\n"),
            ]
        );
    }

    #[tokio::test]
    async fn each_line_in_a_chunk_is_its_own_frame() {
        let frames = relay_all(chunks(&["a\nb\nc\n"])).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], Bytes::from_static(b"c\n"));
    }

    #[tokio::test]
    async fn unterminated_tail_is_forwarded_at_eof() {
        let frames = relay_all(chunks(&["data: x\n", "data: tail"])).await;
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"data: x\n"),
                Bytes::from_static(b"data: tail"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_upstream_yields_nothing() {
        assert!(relay_all(vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn read_error_ends_relay_and_drops_partial_line() {
        let input = vec![
            Ok(Bytes::from_static(b"data: one\n")),
            Ok(Bytes::from_static(b"data: par")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: never\n")),
        ];
        let frames = relay_all(input).await;
        assert_eq!(frames, vec![Bytes::from_static(b"data: one\n")]);
    }

    #[tokio::test]
    async fn guard_released_when_relay_is_dropped() {
        let in_flight = Arc::new(AtomicU64::new(0));
        let guard = InFlightGuard::new(in_flight.clone());
        assert_eq!(in_flight.load(Ordering::Relaxed), 1);

        let mut stream = Box::pin(line_stream(
            futures_util::stream::iter(chunks(&["a\n", "b\n"])),
            guard,
        ));
        assert!(stream.next().await.is_some());
        assert_eq!(in_flight.load(Ordering::Relaxed), 1, "still relaying");

        drop(stream);
        assert_eq!(in_flight.load(Ordering::Relaxed), 0);
    }
}

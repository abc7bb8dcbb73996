//! SSE re-framing: upstream event streams re-emitted in a client dialect.

pub mod anthropic;
pub mod chat;
pub mod responses;
pub mod sse;

pub use anthropic::AnthropicReframer;
pub use chat::ChatReframer;
pub use responses::ResponsesReframer;
pub use sse::{SseDecoder, SseEvent};

use futures_util::stream::{self, Stream, StreamExt};
use hyper::body::Bytes;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use tracing::{debug, warn};

/// Lifecycle shared by every re-framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Streaming,
    Completed,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Failed)
    }
}

/// A per-dialect state machine from upstream events to client frames.
///
/// Once [`state`](Reframer::state) is terminal, every method returns no frames.
pub trait Reframer: Send + 'static {
    fn on_event(&mut self, event: SseEvent) -> Vec<Bytes>;

    /// Upstream closed without a terminal event.
    fn on_eof(&mut self) -> Vec<Bytes>;

    /// Upstream read failed mid-stream.
    fn on_transport_error(&mut self, error: &str) -> Vec<Bytes>;

    fn state(&self) -> StreamState;
}

struct Driver<S, R> {
    upstream: Option<Pin<Box<S>>>,
    decoder: SseDecoder,
    reframer: R,
    pending: VecDeque<Bytes>,
}

impl<S, R: Reframer> Driver<S, R> {
    fn feed(&mut self, chunk: &[u8]) {
        for event in self.decoder.feed(chunk) {
            if self.reframer.state().is_terminal() {
                break;
            }
            self.pending.extend(self.reframer.on_event(event));
        }
    }

    fn end_of_stream(&mut self) {
        for event in self.decoder.finish() {
            if self.reframer.state().is_terminal() {
                break;
            }
            self.pending.extend(self.reframer.on_event(event));
        }
        if !self.reframer.state().is_terminal() {
            self.pending.extend(self.reframer.on_eof());
        }
    }

    /// Dropping the upstream body releases its connection.
    fn release(&mut self) {
        self.upstream = None;
    }
}

/// Drive `reframer` over an upstream byte stream.
///
/// Frames come out in upstream order; the stream ends right after the
/// re-framer reaches a terminal state. Dropping the returned stream drops
/// the upstream body.
pub fn reframe<S, E, R>(upstream: S, reframer: R) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    R: Reframer,
{
    let driver = Driver {
        upstream: Some(Box::pin(upstream)),
        decoder: SseDecoder::new(),
        reframer,
        pending: VecDeque::new(),
    };

    stream::unfold(driver, |mut driver| async move {
        loop {
            if let Some(frame) = driver.pending.pop_front() {
                return Some((Ok(frame), driver));
            }
            let next = driver.upstream.as_mut()?.next().await;

            match next {
                Some(Ok(chunk)) => {
                    driver.feed(&chunk);
                    if driver.reframer.state().is_terminal() {
                        driver.release();
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Upstream stream read failed");
                    let frames = driver.reframer.on_transport_error(&e.to_string());
                    driver.pending.extend(frames);
                    driver.release();
                }
                None => {
                    debug!("Upstream stream ended");
                    driver.end_of_stream();
                    driver.release();
                }
            }
        }
    })
}

/// Emit pre-built frames as a stream body, for replayed answers.
pub fn replay(frames: Vec<Bytes>) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    stream::iter(frames.into_iter().map(Ok))
}

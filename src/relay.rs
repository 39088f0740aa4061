//! Framing of upstream chunks into the `/chat-process` response body.
//!
//! The body is newline-separated JSON: one object per chunk, no leading or
//! trailing separator. An upstream failure is appended as one more line in
//! the `{status: "Fail", ...}` envelope, after which the body ends.

use std::convert::Infallible;

use bytes::Bytes;
use futures::Stream;
use futures_util::StreamExt;
use log::{debug, error, info};
use serde::Serialize;
use tokio::{sync::mpsc, task::AbortHandle};

use crate::error::UpstreamError;
use crate::io_struct::{ApiResponse, ChatChunk};
use crate::upstream::ChunkStream;

/// Chunks buffered between the upstream producer and the response writer.
const RELAY_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    AwaitingRequest,
    Streaming,
    Closed,
}

/// Tracks the relay state machine and produces the bytes for each line.
#[derive(Debug)]
pub struct ChunkFramer {
    phase: RelayPhase,
    lines: usize,
}

impl Default for ChunkFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkFramer {
    pub fn new() -> Self {
        ChunkFramer {
            phase: RelayPhase::AwaitingRequest,
            lines: 0,
        }
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn begin(&mut self) {
        if self.phase == RelayPhase::AwaitingRequest {
            self.phase = RelayPhase::Streaming;
        }
    }

    /// Frames one chunk. Returns `None` once the relay is closed.
    pub fn chunk(&mut self, chunk: &ChatChunk) -> Option<Bytes> {
        if self.phase != RelayPhase::Streaming {
            return None;
        }
        match serde_json::to_vec(chunk) {
            Ok(json) => Some(self.line(json)),
            Err(e) => self.fail(&e.to_string()),
        }
    }

    /// Frames the terminal error line and closes the relay.
    pub fn error(&mut self, err: &UpstreamError) -> Option<Bytes> {
        self.fail(&err.to_string())
    }

    /// Moves to `Closed`. Returns `true` only for the call that closed it.
    pub fn close(&mut self) -> bool {
        let was_open = self.phase != RelayPhase::Closed;
        self.phase = RelayPhase::Closed;
        was_open
    }

    fn fail(&mut self, message: &str) -> Option<Bytes> {
        if self.phase != RelayPhase::Streaming {
            return None;
        }
        let line = encode(&ApiResponse::<()>::fail(message)).map(|json| self.line(json));
        self.close();
        line
    }

    fn line(&mut self, json: Vec<u8>) -> Bytes {
        let bytes = if self.lines == 0 {
            Bytes::from(json)
        } else {
            let mut framed = Vec::with_capacity(json.len() + 1);
            framed.push(b'\n');
            framed.extend_from_slice(&json);
            Bytes::from(framed)
        };
        self.lines += 1;
        bytes
    }
}

fn encode<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    serde_json::to_vec(value).ok()
}

/// Aborts the upstream producer when the response body is dropped, which
/// is what happens when the client goes away mid-stream.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            debug!("Response dropped before upstream finished, aborting upstream call");
            self.0.abort();
        }
    }
}

/// Turns an upstream chunk stream into the response body stream.
///
/// The upstream is driven by a spawned producer so that transport framing is
/// decoupled from upstream I/O; dropping the returned stream cancels it.
pub fn relay_body(upstream: ChunkStream) -> impl Stream<Item = Result<Bytes, Infallible>> + 'static {
    let (tx, mut rx) = mpsc::channel::<Result<ChatChunk, UpstreamError>>(RELAY_BUFFER);

    let producer = tokio::spawn(async move {
        let mut upstream = upstream;
        while let Some(item) = upstream.next().await {
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                debug!("Relay receiver closed, stopping upstream");
                return;
            }
            if failed {
                return;
            }
        }
    });
    let guard = AbortOnDrop(producer.abort_handle());

    async_stream::stream! {
        let _guard = guard;
        let mut framer = ChunkFramer::new();
        framer.begin();

        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    if let Some(bytes) = framer.chunk(&chunk) {
                        yield Ok::<_, Infallible>(bytes);
                    }
                }
                Err(err) => {
                    error!("Upstream failed after {} chunks: {}", framer.lines(), err);
                    if let Some(bytes) = framer.error(&err) {
                        yield Ok(bytes);
                    }
                    break;
                }
            }
            if framer.phase() == RelayPhase::Closed {
                break;
            }
        }

        if framer.close() {
            info!("Relay finished after {} chunks", framer.lines());
        }
    }
}

//! Child output relay.
//!
//! Each captured stream of a child process is drained by its own pump task.
//! A pump reads raw chunks through a [`FramedRead`] backed by [`BytesCodec`]
//! and hands every chunk to an [`OutputSink`], which:
//! - mirrors it onto this process's stdout/stderr (when echo is enabled),
//! - appends it to the session's bounded [`OutputLog`],
//! - publishes an [`OutputEvent`] to broadcast subscribers.
//!
//! Chunks from one stream are delivered in the order the OS produced them.
//! Stdout and stderr are not ordered relative to each other.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, warn};

use crate::harness::readiness::ReadinessWatcher;

/// Capacity of the output notification channel.
///
/// Subscribers that fall further behind than this observe a lag and skip
/// the oldest chunks; the accumulated log is unaffected.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Which child stream a chunk was read from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Child standard output.
    Stdout,
    /// Child standard error.
    Stderr,
}

/// One chunk of child output, published to subscribers as it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    /// Stream the chunk came from.
    pub stream: StreamKind,
    /// Raw chunk bytes.
    pub chunk: Bytes,
}

impl OutputEvent {
    /// Chunk contents as text, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.chunk)
    }
}

/// Append-only record of everything a session's children printed.
///
/// Bounded by `max_bytes`: once full, further chunks are dropped from the
/// log (but still echoed and published) and the log is flagged truncated.
#[derive(Debug, Clone)]
pub struct OutputLog {
    bytes: Vec<u8>,
    max_bytes: usize,
    truncated: bool,
}

impl OutputLog {
    /// Create an empty log holding at most `max_bytes`.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max_bytes,
            truncated: false,
        }
    }

    /// Append a chunk, keeping whatever prefix still fits.
    ///
    /// Returns `false` when any part of the chunk was dropped.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        let room = self.max_bytes.saturating_sub(self.bytes.len());
        if chunk.len() <= room {
            self.bytes.extend_from_slice(chunk);
            return true;
        }
        self.bytes.extend_from_slice(&chunk[..room]);
        self.truncated = true;
        false
    }

    /// Raw accumulated bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Accumulated output as text, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Number of bytes retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been retained yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the bound was hit and output was dropped.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Output log shared between the pump tasks of one session.
pub type SharedOutputLog = Arc<Mutex<OutputLog>>;

/// Destination for chunks read from a child stream.
#[derive(Debug, Clone)]
pub struct OutputSink {
    session_id: String,
    log: SharedOutputLog,
    events: broadcast::Sender<OutputEvent>,
    echo: bool,
}

impl OutputSink {
    /// Create a sink feeding `log` and `events`, mirroring to the host when
    /// `echo` is set.
    #[must_use]
    pub fn new(
        session_id: String,
        log: SharedOutputLog,
        events: broadcast::Sender<OutputEvent>,
        echo: bool,
    ) -> Self {
        Self {
            session_id,
            log,
            events,
            echo,
        }
    }

    /// Relay one chunk: echo, append, then notify.
    pub async fn deliver(&self, stream: StreamKind, chunk: Bytes) {
        if self.echo {
            self.echo_chunk(stream, &chunk).await;
        }

        {
            let mut log = self.log.lock().await;
            let already_truncated = log.is_truncated();
            if !log.append(&chunk) && !already_truncated {
                warn!(
                    session_id = self.session_id,
                    retained = log.len(),
                    "output log bound reached, dropping further output"
                );
            }
        }

        // No subscribers is the common case.
        let _ = self.events.send(OutputEvent { stream, chunk });
    }

    async fn echo_chunk(&self, stream: StreamKind, chunk: &[u8]) {
        let result = match stream {
            StreamKind::Stdout => {
                let mut out = tokio::io::stdout();
                match out.write_all(chunk).await {
                    Ok(()) => out.flush().await,
                    Err(err) => Err(err),
                }
            }
            StreamKind::Stderr => {
                let mut err_out = tokio::io::stderr();
                match err_out.write_all(chunk).await {
                    Ok(()) => err_out.flush().await,
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = result {
            debug!(session_id = self.session_id, ?stream, %err, "failed to echo child output");
        }
    }
}

/// Drain `reader` until EOF, relaying each chunk through `sink`.
///
/// When a `watcher` is supplied, every chunk is also offered to it until it
/// fires; after that it is dropped so later chunks skip the check. At EOF
/// the watcher tests any unterminated tail before it is dropped.
///
/// Read errors end the pump with a warning; whatever was read before the
/// error has already been relayed.
pub async fn pump_stream<R>(
    reader: R,
    stream: StreamKind,
    sink: OutputSink,
    mut watcher: Option<ReadinessWatcher>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, BytesCodec::new());

    while let Some(item) = framed.next().await {
        match item {
            Ok(chunk) => {
                let chunk = chunk.freeze();
                // Relay first so the log already holds the marker line when
                // the readiness wait resolves.
                sink.deliver(stream, chunk.clone()).await;
                if let Some(active) = watcher.as_mut() {
                    active.observe(&chunk);
                    if !active.is_registered() {
                        watcher = None;
                    }
                }
            }
            Err(err) => {
                warn!(session_id = sink.session_id, ?stream, %err, "child stream read failed");
                break;
            }
        }
    }

    if let Some(mut active) = watcher {
        active.finish();
    }
    debug!(session_id = sink.session_id, ?stream, "child stream closed");
}

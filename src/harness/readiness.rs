//! Readiness marker detection.
//!
//! The server announces that it accepts connections with a stdout line of
//! the form `... started server on <addr>, url: <url>`. The
//! [`ReadinessWatcher`] buffers raw stdout bytes, tests each complete line
//! and the unterminated tail, and resolves a one-shot channel with the
//! parsed URL on the first match. After that it is inert.

use tokio::sync::oneshot;
use url::Url;

use crate::{AppError, Result};

/// Text that marks the readiness line.
pub const READY_MARKER: &str = "started server on";

/// Field introducing the announced endpoint on the readiness line.
pub const URL_FIELD: &str = "url:";

/// Longest unterminated line kept while waiting for its newline.
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Test one output line against the readiness contract.
///
/// # Return value
///
/// - `None`: the line is not a readiness line.
/// - `Some(Ok(url))`: the line matched and its URL parsed.
/// - `Some(Err(AppError::InvalidUrl(..)))`: the line matched but the value
///   after `url:` is not a valid URL.
#[must_use]
pub fn parse_ready_line(line: &str) -> Option<Result<Url>> {
    if !line.contains(READY_MARKER) {
        return None;
    }
    let (_, value) = line.split_once(URL_FIELD)?;
    let value = value.trim();

    Some(
        Url::parse(value)
            .map_err(|err| AppError::InvalidUrl(format!("{value:?} from readiness line: {err}"))),
    )
}

/// One-shot subscriber resolving with the first announced URL.
#[derive(Debug)]
pub struct ReadinessWatcher {
    tx: Option<oneshot::Sender<Result<Url>>>,
    pending: Vec<u8>,
}

impl ReadinessWatcher {
    /// Create a watcher and the receiver its first match resolves.
    ///
    /// The receiver errors with `RecvError` if the watcher is dropped
    /// without ever matching (the stream ended first).
    #[must_use]
    pub fn new() -> (Self, oneshot::Receiver<Result<Url>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                pending: Vec::new(),
            },
            rx,
        )
    }

    /// Whether the watcher is still waiting for its first match.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.tx.is_some()
    }

    /// Feed a chunk of raw stdout bytes.
    ///
    /// Complete lines are decoded and tested one by one. The unterminated
    /// tail is tested too, so a marker printed without a newline is still
    /// seen, but it only fires once its URL parses and its bytes are
    /// complete UTF-8; otherwise it waits for more output.
    pub fn observe(&mut self, chunk: &[u8]) {
        if self.tx.is_none() {
            return;
        }
        self.pending.extend_from_slice(chunk);

        while let Some(end) = self.pending.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if let Some(result) = parse_ready_line(&String::from_utf8_lossy(&line)) {
                self.fire(result);
                return;
            }
        }

        if let Ok(tail) = std::str::from_utf8(&self.pending) {
            if let Some(Ok(url)) = parse_ready_line(tail) {
                self.fire(Ok(url));
                return;
            }
        }

        if self.pending.len() > MAX_PENDING_LINE {
            self.pending.clear();
        }
    }

    /// Test whatever unterminated text is left once the stream has ended.
    pub fn finish(&mut self) {
        if self.tx.is_none() || self.pending.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.pending);
        if let Some(result) = parse_ready_line(&String::from_utf8_lossy(&tail)) {
            self.fire(result);
        }
    }

    fn fire(&mut self, result: Result<Url>) {
        self.pending.clear();
        if let Some(tx) = self.tx.take() {
            // The waiter may have given up already (timeout or drop).
            let _ = tx.send(result);
        }
    }
}

//! Error types.

use thiserror::Error;

/// Errors surfaced by the runtime.
///
/// Datapath packet anomalies (bad headers, unknown sessions, stale request
/// numbers) are not represented here; they are dropped silently with a
/// counter increment. Retryable conditions (loss, credit stalls) are handled
/// transparently by the dispatch loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer refused the session or did not reply within the retry budget.
    #[error("session connect failed: {0}")]
    SessionConnectFailed(&'static str),

    /// Peer declared the session dead or the transport reported a fatal
    /// fault; all outstanding requests were failed.
    #[error("session reset")]
    SessionReset,

    /// All session slots hold an outstanding request. Returned synchronously
    /// from `enqueue_request`; the caller retries after running the event
    /// loop.
    #[error("all session slots busy")]
    TooManyOutstanding,

    /// The peer's response is larger than the caller-provided response
    /// buffer. Delivered through the continuation.
    #[error("response of {needed} bytes exceeds buffer of {available} bytes")]
    MsgBufferTooSmall { needed: usize, available: usize },

    /// Remote routing info was rejected by the local transport.
    #[error("could not resolve remote routing info")]
    RoutingResolutionFailed,

    /// Transport-layer fatal error; the endpoint is unusable.
    #[error("transport fatal: {0}")]
    TransportFatal(String),

    /// Invalid construction-time parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failed `enqueue_request`, handing the caller's buffers back.
pub struct EnqueueError {
    pub error: Error,
    pub req_msgbuf: crate::buffer::MsgBuffer,
    pub resp_msgbuf: crate::buffer::MsgBuffer,
}

impl std::fmt::Debug for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for EnqueueError {}

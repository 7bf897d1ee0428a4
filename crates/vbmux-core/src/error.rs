//! Error taxonomy for the routing core.
//!
//! One `thiserror` enum per crate, `#[from]` for wrapped causes, a
//! crate-local `Result<T>` alias — the same shape as the teacher's
//! `ServerError`/cluster `Error` types.

use vbmux_types::ServerAddress;

/// Coarse classification of a transport failure, used to decide whether a
/// socket must be torn down or can keep serving other in-flight ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The peer closed the connection (clean or otherwise): treated as an
    /// ordinary reconnect trigger, not a reason to log loudly.
    Eof,
    /// Any other I/O failure (reset, timeout, broken pipe, ...).
    Io,
    /// The socket was already closed locally when the operation was
    /// attempted (e.g. a send raced a `Close`).
    Closed,
    /// The peer sent a structurally invalid frame.
    Protocol,
    /// The peer rejected a collection-aware operation outright (distinct
    /// from an ordinary I/O failure so the pipeline client can finalize
    /// the request instead of consulting the retry orchestrator).
    CollectionsUnsupported,
}

/// A transport-layer failure reported by a [`crate::transport::MemdClient`]
/// implementation. The wire codec itself is out of scope for this crate;
/// this type is deliberately thin, carrying just enough for the pipeline
/// client to decide whether to redial.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn eof() -> Self {
        Self::new(TransportErrorKind::Eof, "connection closed by peer")
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TransportErrorKind::Eof
    }
}

/// Errors surfaced to a request's terminal callback or to a direct `KvMux`
/// call. Mirrors `spec.md` §7's named kinds exactly; nothing here is
/// wire-level, that's [`TransportError`].
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The mux (or the pipeline/client serving the request) has been
    /// explicitly closed. Terminal: no further requests are accepted.
    #[error("multiplexer is shut down")]
    Shutdown,

    /// A replica index outside the bucket's replica count, or a replica
    /// request against a bucket type that has no replicas.
    #[error("invalid replica index {index} for bucket type {bucket_type:?}")]
    InvalidReplica {
        index: i32,
        bucket_type: vbmux_types::BucketType,
    },

    /// A request was structurally unroutable: missing key on a keyed
    /// bucket, a vbucket id outside the map's range, and similar
    /// caller-side mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `DispatchDirectToAddress` named a server not present in the
    /// currently-applied topology.
    #[error("server {0} is not part of the current topology")]
    InvalidServer(ServerAddress),

    /// The target pipeline's operation queue is at capacity.
    #[error("pipeline operation queue is full")]
    Overload,

    /// The target pipeline client's circuit breaker is open and the retry
    /// orchestrator declined to wait for it to close.
    #[error("circuit breaker is open")]
    CircuitBreakerOpen,

    /// A transport-layer failure the retry orchestrator declined to retry.
    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// The request was cancelled (explicitly, or by a takeover draining
    /// its queue) before it could be dispatched or completed.
    #[error("request cancelled")]
    Cancelled,

    /// The request targets a bucket type that does not support
    /// collections-aware addressing.
    #[error("bucket does not support collections")]
    CollectionsUnsupported,
}

pub type MuxResult<T> = Result<T, MuxError>;

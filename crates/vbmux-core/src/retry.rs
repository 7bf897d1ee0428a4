//! The retry orchestrator seam: deciding whether and how long to wait
//! before a request re-enters routing is a policy the core delegates out,
//! per `spec.md` §6 ("assumed to provide a `RetryOrchestrator`").

use std::sync::Arc;

use crate::request::Request;

/// Why the core is asking the orchestrator whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The target pipeline client's breaker is open.
    CircuitBreakerOpen,
    /// No socket is currently available for the target (dialing, or the
    /// pipeline has no healthy client yet).
    SocketNotAvailable,
}

/// External retry policy. Implementations decide whether a request should
/// wait and be resubmitted, and for how long, given why dispatch failed.
///
/// `wait_and_retry` returning `true` means: the implementation has already
/// performed whatever wait it wanted, and the caller should resubmit the
/// request. Returning `false` means: give up, complete the request with
/// the error that prompted the retry.
#[async_trait::async_trait]
pub trait RetryOrchestrator: Send + Sync {
    async fn wait_and_retry(&self, request: &Arc<Request>, reason: RetryReason) -> bool;
}

/// A retry orchestrator that never retries. Useful as a default for
/// callers that want fail-fast semantics, and for the breaker's own
/// canary sends, which must never recurse back into retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

#[async_trait::async_trait]
impl RetryOrchestrator for NeverRetry {
    async fn wait_and_retry(&self, _request: &Arc<Request>, _reason: RetryReason) -> bool {
        false
    }
}

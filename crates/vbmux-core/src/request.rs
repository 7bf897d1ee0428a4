//! The in-flight request: the unit the rest of this crate routes, queues,
//! retries, and completes exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use vbmux_types::{Opaque, Opcode, VbucketId, DIRECT_DISPATCH_REPLICA_SENTINEL};

use crate::error::MuxResult;

/// Whatever the wire codec decoded for a completed operation. The codec
/// itself is out of scope for this crate (assumed via [`crate::transport::MemdClient`]);
/// this is just enough for the core to hand a result back to the caller.
#[derive(Debug, Clone)]
pub struct Response {
    pub opaque: Opaque,
    pub payload: Bytes,
}

/// A request's terminal outcome callback. Invoked exactly once, per
/// `spec.md` §7 ("every request terminates via exactly one callback").
pub type CompletionCallback = Box<dyn FnOnce(MuxResult<Response>) + Send>;

/// How a request should be retried by the external [`crate::retry::RetryOrchestrator`].
/// The core never interprets this itself — it is opaque pass-through data
/// carried alongside the request for the orchestrator to consult.
pub trait RetryStrategy: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;
}

/// A strategy that never retries. Used for the circuit breaker's canary
/// probes (spec §4.2 "a no-op request with a fail-fast retry strategy"),
/// since a canary that itself got retried would defeat its purpose.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn name(&self) -> &'static str {
        "fail-fast"
    }
}

/// The ordinary caller-facing strategy: retry per the orchestrator's
/// policy (backoff, deadline, reason-specific rules).
#[derive(Debug, Clone, Copy, Default)]
pub struct BestEffortRetryStrategy;

impl RetryStrategy for BestEffortRetryStrategy {
    fn name(&self) -> &'static str {
        "best-effort"
    }
}

/// A single in-flight key-value operation as it travels from `KvMux` to a
/// pipeline client's socket and back.
///
/// `vbucket` and `replica_idx` are mutable: `KvMux` computes/caches the
/// vbucket on first routing, and a replica pin is rewritten to the direct-
/// dispatch sentinel after `DispatchDirectToAddress` so a later retry can't
/// silently fall back to normal vbucket/ketama routing. Everything else is
/// immutable for the request's lifetime.
pub struct Request {
    pub opcode: Opcode,
    pub key: Bytes,
    pub payload: Bytes,
    pub opaque: Opaque,
    pub retry_strategy: Arc<dyn RetryStrategy>,
    vbucket: Mutex<Option<VbucketId>>,
    replica_idx: AtomicI32,
    callback: Mutex<Option<CompletionCallback>>,
    completed: AtomicBool,
    cancelled: AtomicBool,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("opcode", &self.opcode)
            .field("opaque", &self.opaque)
            .field("vbucket", &self.vbucket())
            .field("replica_idx", &self.replica_idx())
            .field("cancelled", &self.is_cancelled())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Request {
    pub fn new(
        opcode: Opcode,
        key: Bytes,
        payload: Bytes,
        opaque: Opaque,
        replica_idx: i32,
        retry_strategy: Arc<dyn RetryStrategy>,
        callback: CompletionCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            opcode,
            key,
            payload,
            opaque,
            retry_strategy,
            vbucket: Mutex::new(None),
            replica_idx: AtomicI32::new(replica_idx),
            callback: Mutex::new(Some(callback)),
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Builds the breaker's canary: a no-op, fail-fast, fire-and-forget
    /// probe whose outcome never reaches a caller.
    pub fn canary(opaque: Opaque) -> Arc<Self> {
        Self::new(
            Opcode::Noop,
            Bytes::new(),
            Bytes::new(),
            opaque,
            DIRECT_DISPATCH_REPLICA_SENTINEL,
            Arc::new(FailFastRetryStrategy),
            Box::new(|_| {}),
        )
    }

    pub fn vbucket(&self) -> Option<VbucketId> {
        *self.vbucket.lock()
    }

    pub fn set_vbucket(&self, vbucket: VbucketId) {
        *self.vbucket.lock() = Some(vbucket);
    }

    pub fn replica_idx(&self) -> i32 {
        self.replica_idx.load(Ordering::Acquire)
    }

    pub fn set_replica_idx(&self, idx: i32) {
        self.replica_idx.store(idx, Ordering::Release);
    }

    /// Pins this request to a direct-dispatch address, so a subsequent
    /// retry cannot re-enter normal vbucket/ketama routing.
    pub fn pin_direct_dispatch(&self) {
        self.set_replica_idx(DIRECT_DISPATCH_REPLICA_SENTINEL);
    }

    pub fn is_direct_dispatch(&self) -> bool {
        self.replica_idx() == DIRECT_DISPATCH_REPLICA_SENTINEL
    }

    /// Marks the request cancelled. Returns `true` if this call performed
    /// the transition (i.e. the request was not already cancelled).
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Invokes the terminal callback with `result`. Idempotent: only the
    /// first call after construction (or after `cancel`) has any effect,
    /// so a race between e.g. a takeover's drain and an in-flight
    /// completion hook can never double-fire the caller's callback.
    pub fn complete(&self, result: MuxResult<Response>) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxError;
    use std::sync::atomic::AtomicUsize;

    fn noop_request() -> Arc<Request> {
        Request::new(
            Opcode::Data(0),
            Bytes::from_static(b"key"),
            Bytes::new(),
            Opaque::new(1),
            0,
            Arc::new(BestEffortRetryStrategy),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn complete_invokes_callback_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let req = Request::new(
            Opcode::Data(0),
            Bytes::from_static(b"key"),
            Bytes::new(),
            Opaque::new(1),
            0,
            Arc::new(BestEffortRetryStrategy),
            Box::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        req.complete(Err(MuxError::Cancelled));
        req.complete(Err(MuxError::Shutdown));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(req.is_completed());
    }

    #[test]
    fn cancel_is_one_shot() {
        let req = noop_request();
        assert!(req.cancel());
        assert!(!req.cancel());
        assert!(req.is_cancelled());
    }

    #[test]
    fn direct_dispatch_pin_survives_reads() {
        let req = noop_request();
        req.pin_direct_dispatch();
        assert!(req.is_direct_dispatch());
        assert_eq!(req.replica_idx(), DIRECT_DISPATCH_REPLICA_SENTINEL);
    }
}

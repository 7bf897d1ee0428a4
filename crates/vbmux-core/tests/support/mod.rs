//! Test doubles shared by the scenario tests in this crate's `tests/`
//! directory: an in-memory [`MemdClient`] and a scriptable
//! [`RetryOrchestrator`], mirroring the "TestServer"/harness pattern
//! used in the teacher's `kimberlite-client` dev-dependencies but kept
//! local to this crate rather than extracted to a separate package.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use vbmux_core::{
    CompletionCallback, MemdClient, Request, Response, RetryOrchestrator, RetryReason,
    TransportError, TransportErrorKind,
};
use vbmux_types::ServerAddress;

/// A socket double that always answers with an ok response unless
/// poisoned (see [`PoisonableClient::poison`]), and reports every
/// successfully-sent opaque in submission order for FIFO assertions.
pub struct PoisonableClient {
    pub address: ServerAddress,
    closed_notify: Arc<Notify>,
    closed: AtomicBool,
    poisoned: AtomicBool,
    pub sent_opaques: Mutex<Vec<u64>>,
    pub send_count: AtomicUsize,
}

impl PoisonableClient {
    pub fn new(address: ServerAddress) -> Arc<Self> {
        Arc::new(Self {
            address,
            closed_notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            sent_opaques: Mutex::new(Vec::new()),
            send_count: AtomicUsize::new(0),
        })
    }

    /// From the next `send_request` call onward, every send fails with
    /// a transient I/O error (used to model S4 "socket failure").
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    /// Heals the node: subsequent sends (including breaker canaries)
    /// succeed again.
    pub fn unpoison(&self) {
        self.poisoned.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resets the closed flag, modeling a fresh TCP connection on
    /// redial even though the same double is reused for bookkeeping.
    fn mark_dialed(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MemdClient for PoisonableClient {
    async fn send_request(&self, request: Arc<Request>, hook: CompletionCallback) -> Result<(), TransportError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if self.poisoned.load(Ordering::SeqCst) {
            // `Eof`, not `Io`: dispatch_one only tears the socket down on
            // a non-eof error, and a poisoned node here models a live
            // connection whose sends keep failing, not a dead socket.
            return Err(TransportError::eof());
        }
        self.sent_opaques.lock().unwrap().push(request.opaque.get());
        hook(Ok(Response {
            opaque: request.opaque,
            payload: Bytes::new(),
        }));
        Ok(())
    }

    async fn closed(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.closed_notify.notified().await;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
    }
}

/// Builds a [`vbmux_core::ClientFactory`] that hands out (and tracks)
/// one [`PoisonableClient`] per address, so a test can reach back into
/// a specific server's socket after the mux has dialed it.
#[derive(Clone, Default)]
pub struct FakeCluster {
    clients: Arc<Mutex<HashMap<String, Arc<PoisonableClient>>>>,
    dial_failures: Arc<AtomicU32>,
    dial_delays: Arc<Mutex<HashMap<String, Duration>>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` dial attempts (any address) with a transport
    /// error before succeeding, modeling a node that's briefly down.
    pub fn fail_next_dials(&self, n: u32) {
        self.dial_failures.store(n, Ordering::SeqCst);
    }

    /// Delays every dial to `address` by `duration`, keeping the
    /// matching pipeline's client pool "still dialing" for that long —
    /// used to hold requests in a queue long enough to observe a
    /// topology swap draining them before the socket ever connects.
    pub fn delay_dial(&self, address: &str, duration: Duration) {
        self.dial_delays.lock().unwrap().insert(address.to_string(), duration);
    }

    pub fn client_for(&self, address: &str) -> Arc<PoisonableClient> {
        self.clients
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_insert_with(|| PoisonableClient::new(ServerAddress::from(address)))
            .clone()
    }

    pub fn factory(&self) -> vbmux_core::ClientFactory {
        let cluster = self.clone();
        Arc::new(move |address: ServerAddress| -> BoxFuture<'static, Result<Arc<dyn MemdClient>, TransportError>> {
            let cluster = cluster.clone();
            Box::pin(async move {
                if cluster.dial_failures.load(Ordering::SeqCst) > 0 {
                    cluster.dial_failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(TransportError::new(TransportErrorKind::Io, "dial refused"));
                }
                let delay = cluster.dial_delays.lock().unwrap().get(address.as_str()).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let client = cluster.client_for(address.as_str());
                client.mark_dialed();
                Ok(client as Arc<dyn MemdClient>)
            })
        })
    }
}

/// A retry orchestrator whose answers are scripted per [`RetryReason`],
/// recording every call it received for assertions.
#[derive(Default)]
pub struct ScriptedRetry {
    pub accept_circuit_breaker_open: AtomicBool,
    pub accept_socket_not_available: AtomicBool,
    pub calls: Mutex<Vec<RetryReason>>,
}

impl ScriptedRetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accept_all(self: &Arc<Self>) {
        self.accept_circuit_breaker_open.store(true, Ordering::SeqCst);
        self.accept_socket_not_available.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RetryOrchestrator for ScriptedRetry {
    async fn wait_and_retry(&self, _request: &Arc<Request>, reason: RetryReason) -> bool {
        self.calls.lock().unwrap().push(reason);
        match reason {
            RetryReason::CircuitBreakerOpen => self.accept_circuit_breaker_open.load(Ordering::SeqCst),
            RetryReason::SocketNotAvailable => self.accept_socket_not_available.load(Ordering::SeqCst),
        }
    }
}

//! The reconnect/dispatch loop: the hardest state machine in the crate
//! (spec §4.2). One [`PipelineClient`] owns at most one socket at a
//! time, pumps requests off its parent pipeline's queue, and
//! integrates the circuit breaker's gating and canary probing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use vbmux_types::OpaqueGenerator;

use crate::breaker::{BreakerConfig, CircuitBreaker, CompletionOutcome};
use crate::error::{MuxError, TransportErrorKind};
use crate::pipeline::PipelineCore;
use crate::queue::Consumer;
use crate::request::{CompletionCallback, Request};
use crate::retry::{RetryOrchestrator, RetryReason};
use crate::transport::MemdClient;

/// Backoff between failed dial attempts. The spec does not name a
/// value; this keeps a redial storm from spinning the task tightly
/// against a down node.
const DIAL_RETRY_BACKOFF: Duration = Duration::from_millis(200);

struct ClientState {
    /// `None` is the sticky shutdown signal (spec §3 "`parent == nil`
    /// is sticky and monotonic toward termination").
    parent: Option<Arc<PipelineCore>>,
    client: Option<Arc<dyn MemdClient>>,
    consumer: Option<Consumer<Arc<Request>>>,
}

enum Acquired {
    Ready(Consumer<Arc<Request>>),
    /// The socket died; break out of the pump loop and redial.
    Redial,
    /// `parent` has gone nil; close the socket (if any) and terminate.
    Shutdown,
}

/// One socket's worth of reconnect/dispatch state, owned by a
/// [`crate::pipeline::Pipeline`]'s client pool.
pub struct PipelineClient {
    state: Mutex<ClientState>,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<dyn RetryOrchestrator>,
    opaque_gen: OpaqueGenerator,
    terminated: AtomicBool,
    terminated_notify: tokio::sync::Notify,
}

impl PipelineClient {
    pub fn new(
        parent: Option<Arc<PipelineCore>>,
        breaker_config: BreakerConfig,
        retry: Arc<dyn RetryOrchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ClientState {
                parent,
                client: None,
                consumer: None,
            }),
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
            retry,
            opaque_gen: OpaqueGenerator::new(),
            terminated: AtomicBool::new(false),
            terminated_notify: tokio::sync::Notify::new(),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn has_socket(&self) -> bool {
        self.state.lock().client.is_some()
    }

    /// `ReassignTo(newParent)` (spec §4.2 "Reassignment"): swaps the
    /// parent pointer and retires the active consumer, so the main loop
    /// re-acquires one from the new pipeline without tearing down the
    /// socket. This is how a takeover moves a client across a topology
    /// swap.
    pub fn reassign_to(&self, new_parent: Arc<PipelineCore>) {
        let mut state = self.state.lock();
        state.parent = Some(new_parent);
        if let Some(consumer) = state.consumer.take() {
            consumer.close();
        }
    }

    /// `Close()`: nils the parent (sticky) and retires the active
    /// consumer, then waits for the `Run` loop to observe the nil
    /// parent and fully exit. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            state.parent = None;
            if let Some(consumer) = state.consumer.take() {
                consumer.close();
            }
        }
        loop {
            let notified = self.terminated_notify.notified();
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// The outer `Run` loop (spec §4.2 steps 1-4): read `parent`, reset
    /// the breaker, dial, then pump requests until the socket dies or
    /// shutdown is observed, repeating until `parent` goes nil.
    pub async fn run(self: Arc<Self>) {
        loop {
            let parent = { self.state.lock().parent.clone() };
            let Some(parent) = parent else {
                self.terminated.store(true, Ordering::Release);
                self.terminated_notify.notify_waiters();
                return;
            };

            self.breaker.reset();

            let dial_result = (parent.client_factory)(parent.address.clone()).await;
            let client = match dial_result {
                Ok(client) => client,
                Err(err) => {
                    tracing::debug!(address = %parent.address, error = %err, "pipeline client dial failed");
                    self.breaker.mark_failure();
                    tokio::time::sleep(DIAL_RETRY_BACKOFF).await;
                    continue;
                }
            };

            self.io_loop(client).await;
        }
    }

    fn acquire_consumer(&self) -> Acquired {
        let mut state = self.state.lock();
        if let Some(consumer) = state.consumer.clone() {
            return Acquired::Ready(consumer);
        }
        if state.client.is_none() {
            return Acquired::Redial;
        }
        // Read the *current* parent, not a value captured before this
        // call: `reassign_to` can swap `state.parent` to a new pipeline
        // between iterations of the pump loop below, and the consumer
        // built here must come from whichever pipeline's queue is
        // current right now, or a takeover leaves this client parked on
        // a queue that's about to be drained and closed.
        let Some(parent) = state.parent.clone() else {
            if let Some(client) = state.client.take() {
                client.close();
            }
            return Acquired::Shutdown;
        };
        let consumer = parent.queue.consumer();
        state.consumer = Some(consumer.clone());
        Acquired::Ready(consumer)
    }

    fn clear_stale_consumer(&self) {
        self.state.lock().consumer = None;
    }

    async fn io_loop(self: &Arc<Self>, client: Arc<dyn MemdClient>) {
        {
            let mut state = self.state.lock();
            state.client = Some(client.clone());
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let watcher_client = client.clone();
        let watcher_self = self.clone();
        let watcher = tokio::spawn(async move {
            watcher_client.closed().await;
            let mut state = watcher_self.state.lock();
            state.client = None;
            if let Some(consumer) = state.consumer.take() {
                consumer.close();
            }
            drop(state);
            let _ = kill_tx.send(());
        });

        let canary_self = self.clone();
        let canary_client = client.clone();
        let canary_task = tokio::spawn(async move {
            canary_self.canary_loop(canary_client).await;
        });

        loop {
            match self.acquire_consumer() {
                Acquired::Redial | Acquired::Shutdown => break,
                Acquired::Ready(consumer) => {
                    let Some(request) = consumer.pop().await else {
                        self.clear_stale_consumer();
                        continue;
                    };
                    if self.dispatch_one(&client, request).await {
                        break;
                    }
                }
            }
        }

        canary_task.abort();
        let _ = kill_rx.await;
        let _ = watcher.await;
    }

    /// Sends one request on `client`. Returns `true` if the caller
    /// should break out of the pump loop (socket is no longer usable).
    async fn dispatch_one(&self, client: &Arc<dyn MemdClient>, request: Arc<Request>) -> bool {
        if request.is_cancelled() {
            request.complete(Err(MuxError::Cancelled));
            return false;
        }

        if !self.breaker.allows_request() {
            if self.retry.wait_and_retry(&request, RetryReason::CircuitBreakerOpen).await {
                return false;
            }
            request.complete(Err(MuxError::CircuitBreakerOpen));
            return false;
        }

        let hook = completion_hook(self.breaker.clone(), request.clone());
        match client.send_request(request.clone(), hook).await {
            Ok(()) => false,
            Err(err) => {
                if !err.is_eof() {
                    client.close();
                }
                if err.kind == TransportErrorKind::CollectionsUnsupported {
                    request.complete(Err(MuxError::CollectionsUnsupported));
                    return true;
                }
                if request.is_cancelled() {
                    request.complete(Err(MuxError::Cancelled));
                    return true;
                }
                self.breaker.mark_failure();
                if self.retry.wait_and_retry(&request, RetryReason::SocketNotAvailable).await {
                    return true;
                }
                request.complete(Err(MuxError::Network(err)));
                true
            }
        }
    }

    /// Loops while the breaker is open, sending a no-op canary and
    /// waiting up to [`CircuitBreaker::canary_timeout`] for a response
    /// (spec §4.2 "Canary"). Aborted by the owning `io_loop` when the
    /// socket is torn down.
    async fn canary_loop(self: Arc<Self>, client: Arc<dyn MemdClient>) {
        use crate::breaker::BreakerState;
        loop {
            if self.breaker.state() != BreakerState::Open {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            if !self.breaker.try_begin_canary() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            self.run_one_canary(&client).await;
            self.breaker.end_canary();
        }
    }

    /// Sends exactly one canary and marks the breaker exactly once,
    /// guarded by `marked` against the timeout and the response racing
    /// each other (spec §9: "canary path double-marks failure on the
    /// timeout branch ... clarify that exactly one mark fires").
    async fn run_one_canary(&self, client: &Arc<dyn MemdClient>) {
        let marked = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel::<bool>();
        let marked_for_hook = marked.clone();
        let breaker_for_hook = self.breaker.clone();
        let hook: CompletionCallback = Box::new(move |result| {
            if marked_for_hook.swap(true, Ordering::AcqRel) {
                return;
            }
            if result.is_ok() {
                breaker_for_hook.canary_succeeded();
            } else {
                breaker_for_hook.canary_failed();
            }
            let _ = tx.send(result.is_ok());
        });

        let request = Request::canary(self.opaque_gen.next());
        if client.send_request(request.clone(), hook).await.is_err() {
            if !marked.swap(true, Ordering::AcqRel) {
                self.breaker.canary_failed();
            }
            return;
        }

        match tokio::time::timeout(self.breaker.canary_timeout(), rx).await {
            Ok(_) => {}
            Err(_) => {
                if request.cancel() && !marked.swap(true, Ordering::AcqRel) {
                    self.breaker.canary_failed();
                }
            }
        }
    }
}

fn completion_hook(breaker: Arc<CircuitBreaker>, request: Arc<Request>) -> CompletionCallback {
    Box::new(move |result| {
        let outcome = match &result {
            Ok(_) => CompletionOutcome::Success,
            Err(MuxError::Cancelled) => CompletionOutcome::Ignore,
            Err(_) => CompletionOutcome::Failure,
        };
        breaker.completion_callback(outcome);
        request.complete(result);
    })
}

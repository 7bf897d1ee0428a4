//! Per-node connection pool: a [`Pipeline`] owns one [`OperationQueue`]
//! shared by a fixed-size pool of [`PipelineClient`]s (spec §3
//! "Pipeline", §4.3).

use std::sync::Arc;

use parking_lot::Mutex;
use vbmux_types::ServerAddress;

use crate::breaker::BreakerConfig;
use crate::error::MuxError;
use crate::pipeline_client::PipelineClient;
use crate::queue::{OperationQueue, PushError};
use crate::request::Request;
use crate::retry::RetryOrchestrator;
use crate::transport::ClientFactory;

/// The data a [`PipelineClient`] needs from its owning [`Pipeline`],
/// shared by `Arc` rather than back-referencing the `Pipeline` itself so
/// there is no ownership cycle between a pipeline and its clients.
/// This is spec §3's "back-reference to current parent pipeline" in
/// concrete form: a pipeline client's `parent` field is
/// `Option<Arc<PipelineCore>>`, and the `Pipeline` itself holds the same
/// `Arc` alongside its `Vec<Arc<PipelineClient>>`.
pub(crate) struct PipelineCore {
    pub address: ServerAddress,
    pub queue: OperationQueue<Arc<Request>>,
    pub client_factory: ClientFactory,
}

/// Error returned by [`Pipeline::send_request`]/[`Pipeline::requeue_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipelineSendError {
    #[error("pipeline operation queue is full")]
    Full,
    #[error("pipeline is closed")]
    Closed,
}

/// A per-node connection pool: one queue, `N` [`PipelineClient`]s, all
/// sharing a dial/auth [`ClientFactory`] for `address` (spec §3
/// "Pipeline").
pub struct Pipeline {
    address: ServerAddress,
    core: Arc<PipelineCore>,
    pool_size: usize,
    breaker_config: BreakerConfig,
    retry: Arc<dyn RetryOrchestrator>,
    clients: Mutex<Vec<Arc<PipelineClient>>>,
    started: Mutex<bool>,
}

impl Pipeline {
    pub fn new(
        address: ServerAddress,
        queue_capacity: usize,
        pool_size: usize,
        client_factory: ClientFactory,
        breaker_config: BreakerConfig,
        retry: Arc<dyn RetryOrchestrator>,
    ) -> Self {
        let core = Arc::new(PipelineCore {
            address: address.clone(),
            queue: OperationQueue::new(queue_capacity),
            client_factory,
        });
        Self {
            address,
            core,
            pool_size,
            breaker_config,
            retry,
            clients: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn queue_len(&self) -> usize {
        self.core.queue.len()
    }

    /// `SendRequest(req)` (spec §4.3): enqueues onto this pipeline's
    /// queue.
    pub fn send_request(&self, request: Arc<Request>) -> Result<(), PipelineSendError> {
        match self.core.queue.push(request) {
            Ok(()) => Ok(()),
            Err(PushError::Full(_)) => Err(PipelineSendError::Full),
            Err(PushError::Closed(_)) => Err(PipelineSendError::Closed),
        }
    }

    /// `RequeueRequest(req)`: same semantics as `send_request`, used by
    /// the mux when re-inserting a request drained from elsewhere after
    /// a topology swap.
    pub fn requeue_request(&self, request: Arc<Request>) -> Result<(), PipelineSendError> {
        self.send_request(request)
    }

    /// `StartClients()`: spawns `pool_size` reconnect/dispatch loops,
    /// each running [`PipelineClient::run`] on its own task.
    pub fn start_clients(self: &Arc<Self>) {
        let mut started = self.started.lock();
        if *started {
            return;
        }
        *started = true;
        let mut clients = self.clients.lock();
        for _ in clients.len()..self.pool_size {
            let client = PipelineClient::new(
                Some(self.core.clone()),
                self.breaker_config,
                self.retry.clone(),
            );
            let spawned = client.clone();
            tokio::spawn(async move {
                spawned.run().await;
            });
            clients.push(client);
        }
    }

    /// `Takeover(old)` (spec §4.3, §9 "takeover preserves sockets"): each
    /// of `old`'s clients is reassigned to point at this pipeline's
    /// core, moving it into this pipeline's slot without touching its
    /// socket. `old` retains no clients after this call.
    pub fn takeover(self: &Arc<Self>, old: &Pipeline) {
        let mut old_clients = old.clients.lock();
        let mut new_clients = self.clients.lock();
        for client in old_clients.drain(..) {
            client.reassign_to(self.core.clone());
            new_clients.push(client);
        }
        *self.started.lock() = true;
    }

    /// `Drain(cb)`: drains this pipeline's queue, invoking `cb` for
    /// every still-enqueued request.
    pub fn drain(&self, on_drained: impl FnMut(Arc<Request>)) {
        self.core.queue.drain(on_drained);
    }

    /// `Close()`: shuts down the queue (failing anything still queued
    /// with [`MuxError::Shutdown`]) and tears down every client.
    pub async fn close(&self) {
        self.core.queue.drain(|request| {
            request.complete(Err(MuxError::Shutdown));
        });
        let clients = {
            let mut clients = self.clients.lock();
            std::mem::take(&mut *clients)
        };
        for client in clients {
            client.close().await;
        }
    }
}

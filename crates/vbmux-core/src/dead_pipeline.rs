//! The sink for requests with no routable destination (spec §3, §4.6
//! "Dead Pipeline"). Bound to no address; its clients never connect —
//! in fact it has none — it only exists to hold a queue that can be
//! drained (on shutdown, failing every request) or re-routed (on a
//! topology update that makes the request routable again).

use std::sync::Arc;

use crate::error::MuxError;
use crate::pipeline::PipelineSendError;
use crate::queue::{OperationQueue, PushError};
use crate::request::Request;

/// Sink pipeline for unroutable requests (spec §4.6).
pub struct DeadPipeline {
    queue: OperationQueue<Arc<Request>>,
}

impl DeadPipeline {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue: OperationQueue::new(queue_capacity),
        }
    }

    pub fn send_request(&self, request: Arc<Request>) -> Result<(), PipelineSendError> {
        match self.queue.push(request) {
            Ok(()) => Ok(()),
            Err(PushError::Full(_)) => Err(PipelineSendError::Full),
            Err(PushError::Closed(_)) => Err(PipelineSendError::Closed),
        }
    }

    pub fn drain(&self, on_drained: impl FnMut(Arc<Request>)) {
        self.queue.drain(on_drained);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drains the queue, failing everything left in it with
    /// [`MuxError::Shutdown`] — used by [`crate::kv_mux::KvMux::close`].
    pub fn close(&self) {
        self.queue.drain(|request| {
            request.complete(Err(MuxError::Shutdown));
        });
    }
}

//! The KV multiplexer (spec §3, §4.5 "KV Mux"): an atomically-swappable
//! routing table mapping keys/vbuckets to per-node pipelines, absorbing
//! topology changes without dropping in-flight work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use vbmux_types::{BucketType, ServerAddress, ServerIndex, VbucketId, DIRECT_DISPATCH_REPLICA_SENTINEL};

use crate::dead_pipeline::DeadPipeline;
use crate::error::{MuxError, MuxResult};
use crate::mux_state::{MuxState, MuxStateBuildOptions};
use crate::pipeline::{Pipeline, PipelineSendError};
use crate::request::Request;
use crate::route_config::RouteConfig;

enum RoutedTarget {
    Pipeline(Arc<Pipeline>),
    Dead(Arc<DeadPipeline>),
}

/// The atomically-swappable routing core. Readers take a single atomic
/// load of the current [`MuxState`] snapshot and never lock (spec §9
/// "Atomic pointer to immutable snapshot").
pub struct KvMux {
    state: ArcSwapOption<MuxState>,
    options: MuxStateBuildOptions,
    closed: AtomicBool,
}

impl KvMux {
    pub fn new(options: MuxStateBuildOptions) -> Self {
        Self {
            state: ArcSwapOption::empty(),
            options,
            closed: AtomicBool::new(false),
        }
    }

    /// `true` once at least one [`Self::apply_routing_config`] call has
    /// published a state. Distinguishes "never configured" from
    /// [`Self::is_closed`] (spec.md doesn't separate these; both
    /// surface as [`MuxError::Shutdown`] to callers, but introspection
    /// callers benefit from knowing which).
    pub fn is_bootstrapped(&self) -> bool {
        self.state.load().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn revision(&self) -> Option<u64> {
        self.state.load().as_ref().map(|state| state.revision)
    }

    pub fn config_uuid(&self) -> Option<String> {
        self.state.load().as_ref().map(|state| state.uuid.clone())
    }

    pub fn bucket_type(&self) -> Option<BucketType> {
        self.state.load().as_ref().map(|state| state.bucket_type)
    }

    pub fn num_replicas(&self) -> usize {
        self.state.load().as_ref().map_or(0, |state| state.num_replicas())
    }

    pub fn num_vbuckets(&self) -> usize {
        self.state.load().as_ref().map_or(0, |state| state.num_vbuckets())
    }

    pub fn num_pipelines(&self) -> usize {
        self.state.load().as_ref().map_or(0, |state| state.num_pipelines())
    }

    pub fn vbuckets_on_server(&self, server: ServerIndex) -> Vec<u32> {
        self.state
            .load()
            .as_ref()
            .map_or_else(Vec::new, |state| state.vbuckets_on_server(server))
    }

    /// `SupportsGCCCP`, guarded against a never-published state (spec §9
    /// open question: the source dereferences a potentially-nil state).
    pub fn supports_gcccp(&self) -> bool {
        self.state.load().as_ref().is_some_and(|state| state.supports_gcccp())
    }

    pub fn key_to_vbucket(&self, key: &[u8]) -> Option<VbucketId> {
        self.state.load().as_ref().and_then(|state| state.vbucket_for_key(key))
    }

    pub fn key_to_server(&self, key: &[u8]) -> Option<ServerIndex> {
        let guard = self.state.load();
        let state = guard.as_ref()?;
        match state.bucket_type {
            BucketType::Couchbase => {
                let vbucket = state.vbucket_for_key(key)?;
                let server = state.server_for_vbucket(vbucket, -1)?;
                (server >= 0).then(|| ServerIndex::from(server as u32))
            }
            BucketType::Memcached => state.server_for_key_ketama(key),
            BucketType::None => None,
        }
    }

    pub fn vbucket_to_server(&self, vbucket: VbucketId, replica: i32) -> Option<i32> {
        self.state
            .load()
            .as_ref()
            .and_then(|state| state.server_for_vbucket(vbucket, replica))
    }

    pub fn pipeline_iterator(&self) -> Vec<Arc<Pipeline>> {
        self.state
            .load()
            .as_ref()
            .map_or_else(Vec::new, |state| state.pipelines().to_vec())
    }

    /// `ApplyRoutingConfig(cfg)` (spec §4.5).
    pub async fn apply_routing_config(&self, config: RouteConfig) -> MuxResult<()> {
        let old = self.state.load_full();
        let new_state = MuxState::build(&config, &self.options)?;

        let witnessed = self.state.compare_and_swap(&old, Some(new_state.clone()));
        if !options_ptr_eq(&witnessed, &old) {
            tracing::debug!(
                revision = config.revision,
                "apply_routing_config lost the race to a concurrent update; abandoning"
            );
            return Ok(());
        }

        let Some(old_state) = old else {
            for pipeline in new_state.pipelines() {
                pipeline.start_clients();
            }
            return Ok(());
        };

        for new_pipeline in new_state.pipelines() {
            if let Some(old_pipeline) = old_state.pipeline_for_address(new_pipeline.address()) {
                new_pipeline.takeover(old_pipeline);
            }
            new_pipeline.start_clients();
        }

        for old_pipeline in old_state.pipelines() {
            if new_state.pipeline_for_address(old_pipeline.address()).is_none() {
                old_pipeline.close().await;
            }
        }

        let mut drained: Vec<Arc<Request>> = Vec::new();
        for old_pipeline in old_state.pipelines() {
            old_pipeline.drain(|request| drained.push(request));
        }
        old_state.dead_pipeline().drain(|request| drained.push(request));
        // "Opaque-ordered redispatch" (spec §9): approximate submission
        // order across the swap without a global sequencer.
        drained.sort_by_key(|request| request.opaque.get());
        for request in drained {
            self.requeue_direct(request, true).await;
        }

        Ok(())
    }

    fn route_request(&self, request: &Arc<Request>) -> MuxResult<RoutedTarget> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Shutdown);
        }
        let guard = self.state.load();
        let state = guard.as_ref().ok_or(MuxError::Shutdown)?;
        let replica = request.replica_idx();

        if replica == DIRECT_DISPATCH_REPLICA_SENTINEL {
            // Pinned by a prior `dispatch_direct_to_address`; generic
            // routing must not silently resolve it through vbucket or
            // ketama lookup (spec §4.7: "at most one direct-to-address
            // dispatch").
            return Err(MuxError::InvalidReplica {
                index: replica,
                bucket_type: state.bucket_type,
            });
        }

        if replica < 0 {
            let server = (-replica - 1) as usize;
            return Ok(self.target_for_server_index(state, server));
        }

        match state.bucket_type {
            BucketType::Couchbase => {
                if request.key.is_empty() {
                    return Err(MuxError::InvalidArgument(
                        "couchbase routing requires a non-empty key".into(),
                    ));
                }
                let vbucket = request.vbucket().unwrap_or_else(|| {
                    let vbucket = state.vbucket_for_key(&request.key).unwrap_or(VbucketId::from(0u32));
                    request.set_vbucket(vbucket);
                    vbucket
                });
                match state.server_for_vbucket(vbucket, replica) {
                    Some(server) if server >= 0 => Ok(self.target_for_server_index(state, server as usize)),
                    _ => Ok(RoutedTarget::Dead(state.dead_pipeline().clone())),
                }
            }
            BucketType::Memcached => {
                if replica != 0 {
                    return Err(MuxError::InvalidReplica {
                        index: replica,
                        bucket_type: state.bucket_type,
                    });
                }
                if request.key.is_empty() {
                    return Err(MuxError::InvalidArgument(
                        "memcached routing requires a non-empty key".into(),
                    ));
                }
                let server = state
                    .server_for_key_ketama(&request.key)
                    .ok_or_else(|| MuxError::InvalidArgument("no ketama ring configured".into()))?;
                Ok(self.target_for_server_index(state, server.as_usize()))
            }
            BucketType::None => Err(MuxError::InvalidArgument(
                "no bucket attached; only cluster-level operations are valid".into(),
            )),
        }
    }

    fn target_for_server_index(&self, state: &MuxState, server: usize) -> RoutedTarget {
        match state.get_pipeline(ServerIndex::from(server)) {
            Some(pipeline) => RoutedTarget::Pipeline(pipeline.clone()),
            None => RoutedTarget::Dead(state.dead_pipeline().clone()),
        }
    }

    /// `DispatchDirect(req)` (spec §4.5): route, send; on `closed`
    /// (pipeline torn down mid-swap) re-route and retry; on `full`,
    /// surface [`MuxError::Overload`] immediately.
    pub async fn dispatch_direct(&self, request: Arc<Request>) -> MuxResult<()> {
        loop {
            let target = self.route_request(&request)?;
            let result = match &target {
                RoutedTarget::Pipeline(pipeline) => pipeline.send_request(request.clone()),
                RoutedTarget::Dead(dead) => dead.send_request(request.clone()),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(PipelineSendError::Closed) => continue,
                Err(PipelineSendError::Full) => return Err(MuxError::Overload),
            }
        }
    }

    /// `DispatchDirectToAddress(req, addr)` (spec §4.5): only valid for
    /// `replica_idx == 0`; pins the sentinel so a later retry can't
    /// silently fall back to normal routing.
    pub async fn dispatch_direct_to_address(
        &self,
        request: Arc<Request>,
        address: &ServerAddress,
    ) -> MuxResult<()> {
        if request.replica_idx() != 0 {
            return Err(MuxError::InvalidArgument(
                "dispatch_direct_to_address requires replica_idx == 0".into(),
            ));
        }
        request.pin_direct_dispatch();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(MuxError::Shutdown);
            }
            let guard = self.state.load();
            let state = guard.as_ref().ok_or(MuxError::Shutdown)?;
            let pipeline = state
                .pipeline_for_address(address)
                .cloned()
                .ok_or_else(|| MuxError::InvalidServer(address.clone()))?;
            drop(guard);
            match pipeline.send_request(request.clone()) {
                Ok(()) => return Ok(()),
                Err(PipelineSendError::Closed) => continue,
                Err(PipelineSendError::Full) => return Err(MuxError::Overload),
            }
        }
    }

    /// `RequeueDirect(req, isRetry)` (spec §4.5): internal-only
    /// redispatch used after a topology swap drains a pipeline. On an
    /// unrecoverable routing error, fails `request` with that error,
    /// silencing the warn-level log (not the callback) for a
    /// cancellation observed on a retry path.
    async fn requeue_direct(&self, request: Arc<Request>, is_retry: bool) {
        if let Err(err) = self.dispatch_direct(request.clone()).await {
            if !(is_retry && matches!(err, MuxError::Cancelled)) {
                tracing::debug!(
                    opaque = %request.opaque,
                    error = %err,
                    is_retry,
                    "requeue_direct could not route request after topology swap"
                );
            }
            request.complete(Err(err));
        }
    }

    /// `Close()` (spec §4.5): atomically clears the state, closes every
    /// pipeline, and drains pipelines plus the dead pipeline, failing
    /// each pending request with [`MuxError::Shutdown`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(state) = self.state.swap(None) {
            state.close().await;
        }
    }
}

fn options_ptr_eq(a: &Option<Arc<MuxState>>, b: &Option<Arc<MuxState>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::retry::NeverRetry;
    use crate::route_config::VbucketMap;
    use crate::transport::MemdClient;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use vbmux_types::{Opaque, Opcode};

    fn never_dial_factory() -> crate::transport::ClientFactory {
        Arc::new(|_addr| -> BoxFuture<'static, Result<Arc<dyn MemdClient>, crate::error::TransportError>> {
            Box::pin(async { Err(crate::error::TransportError::new(crate::error::TransportErrorKind::Io, "unused")) })
        })
    }

    fn mux() -> KvMux {
        KvMux::new(MuxStateBuildOptions {
            client_factory: never_dial_factory(),
            breaker_config: BreakerConfig::default(),
            retry: Arc::new(NeverRetry),
            pipeline_queue_capacity: 16,
            dead_pipeline_queue_capacity: 16,
        })
    }

    fn couchbase_config(revision: u64, servers: &[&str]) -> RouteConfig {
        let map = VbucketMap::new(4, 1, vec![0, 1, 1, 0, 0, 1, 1, 0]).unwrap();
        RouteConfig {
            revision,
            bucket_uuid: "uuid-1".into(),
            bucket_type: BucketType::Couchbase,
            kv_servers: servers.iter().map(|s| ServerAddress::from(*s)).collect(),
            vbucket_map: Some(map),
            ketama_ring: None,
            ancillary: Vec::new(),
            pool_size_per_server: 1,
        }
    }

    fn keyed_request(key: &'static str, replica: i32) -> Arc<Request> {
        Request::new(
            Opcode::Data(0),
            Bytes::from_static(key.as_bytes()),
            Bytes::new(),
            Opaque::new(1),
            replica,
            Arc::new(crate::request::BestEffortRetryStrategy),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn never_configured_mux_is_not_bootstrapped_and_routing_fails_shutdown() {
        let mux = mux();
        assert!(!mux.is_bootstrapped());
        assert!(!mux.is_closed());
        assert_eq!(mux.revision(), None);
        assert!(!mux.supports_gcccp());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dispatch_direct_before_bootstrap_fails_shutdown() {
        let mux = mux();
        let req = keyed_request("foo", 0);
        let err = mux.dispatch_direct(req).await.unwrap_err();
        assert!(matches!(err, MuxError::Shutdown));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn apply_routing_config_bootstraps_and_dispatch_reaches_target_pipeline() {
        let mux = mux();
        mux.apply_routing_config(couchbase_config(1, &["a:11210", "b:11210"]))
            .await
            .unwrap();
        assert!(mux.is_bootstrapped());
        assert_eq!(mux.revision(), Some(1));
        assert_eq!(mux.num_pipelines(), 2);

        // "foo" -> vbucket via crc32 mod 4; whichever vbucket it lands
        // on, the map sends the active copy to server 0 or 1 and the
        // queue accepts it either way.
        let req = keyed_request("foo", -1);
        mux.dispatch_direct(req).await.unwrap();
        let total: usize = mux.pipeline_iterator().iter().map(|p| p.queue_len()).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memcached_bucket_rejects_replica_requests() {
        let mux = mux();
        let map_free_config = RouteConfig {
            revision: 1,
            bucket_uuid: "uuid-2".into(),
            bucket_type: BucketType::Memcached,
            kv_servers: vec![ServerAddress::from("a:11210")],
            vbucket_map: None,
            ketama_ring: Some(crate::route_config::KetamaRing::build(&[ServerAddress::from("a:11210")], 4).unwrap()),
            ancillary: Vec::new(),
            pool_size_per_server: 1,
        };
        mux.apply_routing_config(map_free_config).await.unwrap();
        let req = keyed_request("foo", 1);
        let err = mux.dispatch_direct(req).await.unwrap_err();
        assert!(matches!(err, MuxError::InvalidReplica { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn direct_dispatch_pins_sentinel_and_blocks_generic_reroute() {
        let mux = mux();
        mux.apply_routing_config(couchbase_config(1, &["a:11210", "b:11210"]))
            .await
            .unwrap();
        let req = keyed_request("foo", 0);
        mux.dispatch_direct_to_address(req.clone(), &ServerAddress::from("a:11210"))
            .await
            .unwrap();
        assert!(req.is_direct_dispatch());

        let err = mux.dispatch_direct(req).await.unwrap_err();
        assert!(matches!(err, MuxError::InvalidReplica { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn out_of_range_absolute_server_routes_to_dead_pipeline() {
        let mux = mux();
        mux.apply_routing_config(couchbase_config(1, &["a:11210"])).await.unwrap();
        // replica_idx = -6 => absolute server index 5, which doesn't exist.
        let req = keyed_request("foo", -6);
        mux.dispatch_direct(req).await.unwrap();
        // Nothing landed on the one real pipeline; it went to the dead sink.
        let real_total: usize = mux.pipeline_iterator().iter().map(|p| p.queue_len()).sum();
        assert_eq!(real_total, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_fails_in_flight_request_with_shutdown_and_subsequent_calls_error() {
        let mux = mux();
        mux.apply_routing_config(couchbase_config(1, &["a:11210"])).await.unwrap();
        let completed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let completed_clone = completed.clone();
        let req = Request::new(
            Opcode::Data(0),
            Bytes::from_static(b"foo"),
            Bytes::new(),
            Opaque::new(1),
            -1,
            Arc::new(crate::request::BestEffortRetryStrategy),
            Box::new(move |result| {
                assert!(matches!(result, Err(MuxError::Shutdown)));
                completed_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        mux.dispatch_direct(req).await.unwrap();
        mux.close().await;
        assert!(completed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(mux.is_closed());

        let req2 = keyed_request("bar", -1);
        let err = mux.dispatch_direct(req2).await.unwrap_err();
        assert!(matches!(err, MuxError::Shutdown));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn topology_swap_takes_over_shared_address_and_closes_dropped_one() {
        let mux = mux();
        mux.apply_routing_config(couchbase_config(1, &["a:11210", "b:11210"]))
            .await
            .unwrap();
        let b_pipeline_before = mux
            .pipeline_iterator()
            .into_iter()
            .find(|p| p.address().as_str() == "b:11210")
            .unwrap();

        mux.apply_routing_config(couchbase_config(2, &["b:11210", "c:11210"]))
            .await
            .unwrap();

        assert_eq!(mux.revision(), Some(2));
        assert_eq!(mux.num_pipelines(), 2);
        let addresses: Vec<_> = mux
            .pipeline_iterator()
            .iter()
            .map(|p| p.address().as_str().to_string())
            .collect();
        assert!(addresses.contains(&"b:11210".to_string()));
        assert!(addresses.contains(&"c:11210".to_string()));
        assert!(!addresses.contains(&"a:11210".to_string()));
        drop(b_pipeline_before);
    }
}

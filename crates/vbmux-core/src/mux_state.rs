//! Immutable routing snapshot derived from a [`RouteConfig`] (spec §3,
//! §4.4 "Mux State"). One [`Pipeline`] per KV server address,
//! index-aligned with the config's server list, plus one
//! [`DeadPipeline`] sink. Published behind [`crate::kv_mux::KvMux`]'s
//! `ArcSwapOption` and never mutated after construction.

use std::sync::Arc;

use vbmux_types::{BucketType, ServerAddress, ServerIndex, VbucketId};

use crate::breaker::BreakerConfig;
use crate::dead_pipeline::DeadPipeline;
use crate::error::MuxResult;
use crate::pipeline::Pipeline;
use crate::retry::RetryOrchestrator;
use crate::route_config::RouteConfig;
use crate::transport::ClientFactory;

/// Tunables that apply to every pipeline a [`MuxState`] builds, carried
/// alongside a [`RouteConfig`] rather than folded into it since they are
/// connection-policy, not topology.
#[derive(Clone)]
pub struct MuxStateBuildOptions {
    pub client_factory: ClientFactory,
    pub breaker_config: BreakerConfig,
    pub retry: Arc<dyn RetryOrchestrator>,
    pub pipeline_queue_capacity: usize,
    pub dead_pipeline_queue_capacity: usize,
}

pub struct MuxState {
    pub revision: u64,
    pub uuid: String,
    pub bucket_type: BucketType,
    vbucket_map: Option<crate::route_config::VbucketMap>,
    ketama_ring: Option<crate::route_config::KetamaRing>,
    addresses: Vec<ServerAddress>,
    pipelines: Vec<Arc<Pipeline>>,
    dead: Arc<DeadPipeline>,
}

impl MuxState {
    /// Builds a fresh, unstarted snapshot from `config`. Does not spawn
    /// any pipeline clients — the caller ([`crate::kv_mux::KvMux`])
    /// decides whether to `start_clients` or `takeover` each pipeline
    /// after publishing.
    pub fn build(config: &RouteConfig, options: &MuxStateBuildOptions) -> MuxResult<Arc<Self>> {
        config.validate()?;
        let mut pipelines = Vec::with_capacity(config.kv_servers.len());
        for address in &config.kv_servers {
            pipelines.push(Arc::new(Pipeline::new(
                address.clone(),
                options.pipeline_queue_capacity,
                config.pool_size_per_server,
                options.client_factory.clone(),
                options.breaker_config,
                options.retry.clone(),
            )));
        }
        Ok(Arc::new(Self {
            revision: config.revision,
            uuid: config.bucket_uuid.clone(),
            bucket_type: config.bucket_type,
            vbucket_map: config.vbucket_map.clone(),
            ketama_ring: config.ketama_ring.clone(),
            addresses: config.kv_servers.clone(),
            pipelines,
            dead: Arc::new(DeadPipeline::new(options.dead_pipeline_queue_capacity)),
        }))
    }

    pub fn get_pipeline(&self, index: ServerIndex) -> Option<&Arc<Pipeline>> {
        self.pipelines.get(index.as_usize())
    }

    pub fn pipeline_for_address(&self, address: &ServerAddress) -> Option<&Arc<Pipeline>> {
        self.addresses
            .iter()
            .position(|a| a == address)
            .and_then(|idx| self.pipelines.get(idx))
    }

    pub fn address_of(&self, index: ServerIndex) -> Option<&ServerAddress> {
        self.addresses.get(index.as_usize())
    }

    pub fn num_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn dead_pipeline(&self) -> &Arc<DeadPipeline> {
        &self.dead
    }

    /// `KeyToVbucket`: CRC32 of `key` modulo the map's partition count
    /// (spec §4.5 "compute vbucket by CRC-based hash mod P").
    pub fn vbucket_for_key(&self, key: &[u8]) -> Option<VbucketId> {
        let map = self.vbucket_map.as_ref()?;
        let hash = crc32fast::hash(key);
        Some(VbucketId::from(hash % map.partitions() as u32))
    }

    /// `VbucketToServer`: looks up `(vbucket, replica)` in the map,
    /// returning `None` for an out-of-range vbucket or replica (the
    /// caller maps that to the dead pipeline, per spec §4.5 "Returns the
    /// dead pipeline's address on out-of-range").
    pub fn server_for_vbucket(&self, vbucket: VbucketId, replica: i32) -> Option<i32> {
        self.vbucket_map
            .as_ref()
            .and_then(|map| map.server_for(vbucket.as_usize(), replica))
    }

    /// `KeyToServer` for a `memcached`-type bucket: consistent-hash
    /// lookup on the ketama ring.
    pub fn server_for_key_ketama(&self, key: &[u8]) -> Option<ServerIndex> {
        self.ketama_ring.as_ref().map(|ring| ring.server_for(key))
    }

    pub fn num_replicas(&self) -> usize {
        self.vbucket_map.as_ref().map_or(0, |map| map.replicas())
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_map.as_ref().map_or(0, |map| map.partitions())
    }

    /// `VbucketsOnServer`, parameterized correctly by `server` (spec §9
    /// open question: the source always read server 0's row).
    pub fn vbuckets_on_server(&self, server: ServerIndex) -> Vec<u32> {
        self.vbucket_map
            .as_ref()
            .map_or_else(Vec::new, |map| map.vbuckets_on_server(server))
    }

    /// `SupportsGCCCP`: a bucket-less (cluster-level) topology is the
    /// only shape this crate constructs that implies GCCCP is in use.
    pub fn supports_gcccp(&self) -> bool {
        self.bucket_type == BucketType::None
    }

    /// Drains every pipeline and the dead pipeline, failing everything
    /// still queued, then tears down every pipeline's clients. Used by
    /// both [`crate::kv_mux::KvMux::close`] and takeover's "close the
    /// old, orphaned pipeline" step.
    pub async fn close(&self) {
        for pipeline in &self.pipelines {
            pipeline.close().await;
        }
        self.dead.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NeverRetry;
    use crate::route_config::VbucketMap;
    use crate::transport::MemdClient;
    use futures::future::BoxFuture;
    use vbmux_types::BucketType;

    fn never_dial_factory() -> ClientFactory {
        Arc::new(|_addr| -> BoxFuture<'static, Result<Arc<dyn MemdClient>, crate::error::TransportError>> {
            Box::pin(async { Err(crate::error::TransportError::new(crate::error::TransportErrorKind::Io, "unused")) })
        })
    }

    fn options() -> MuxStateBuildOptions {
        MuxStateBuildOptions {
            client_factory: never_dial_factory(),
            breaker_config: BreakerConfig::default(),
            retry: Arc::new(NeverRetry),
            pipeline_queue_capacity: 16,
            dead_pipeline_queue_capacity: 16,
        }
    }

    fn two_server_config() -> RouteConfig {
        let map = VbucketMap::new(4, 1, vec![0, 1, 1, 0, 0, 1, 1, 0]).unwrap();
        RouteConfig {
            revision: 7,
            bucket_uuid: "uuid-1".into(),
            bucket_type: BucketType::Couchbase,
            kv_servers: vec![ServerAddress::from("a:11210"), ServerAddress::from("b:11210")],
            vbucket_map: Some(map),
            ketama_ring: None,
            ancillary: Vec::new(),
            pool_size_per_server: 1,
        }
    }

    #[test]
    fn build_creates_index_aligned_pipelines() {
        let config = two_server_config();
        let state = MuxState::build(&config, &options()).unwrap();
        assert_eq!(state.num_pipelines(), 2);
        assert_eq!(
            state.get_pipeline(ServerIndex::from(0u32)).unwrap().address().as_str(),
            "a:11210"
        );
        assert_eq!(
            state.get_pipeline(ServerIndex::from(1u32)).unwrap().address().as_str(),
            "b:11210"
        );
    }

    #[test]
    fn vbucket_routing_matches_map() {
        let config = two_server_config();
        let state = MuxState::build(&config, &options()).unwrap();
        assert_eq!(state.server_for_vbucket(VbucketId::from(0u32), -1), Some(0));
        assert_eq!(state.server_for_vbucket(VbucketId::from(0u32), 0), Some(1));
        assert_eq!(state.server_for_vbucket(VbucketId::from(99u32), -1), None);
    }

    #[test]
    fn supports_gcccp_only_for_bucketless_state() {
        let mut config = two_server_config();
        let state = MuxState::build(&config, &options()).unwrap();
        assert!(!state.supports_gcccp());

        config.bucket_type = BucketType::None;
        config.vbucket_map = None;
        let state = MuxState::build(&config, &options()).unwrap();
        assert!(state.supports_gcccp());
    }
}

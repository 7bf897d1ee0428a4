//! The immutable topology snapshot delivered by an external config
//! source (HTTP/CCCP polling, out of scope here — spec.md §1, §3
//! "Route Config").

use vbmux_types::{BucketType, ServerAddress, ServerIndex};

use crate::error::{MuxError, MuxResult};

/// `table[vbucket][replica] -> server_index`, `-1` meaning "no server
/// currently owns this (vbucket, replica) pair" (spec §3: "indexes the
/// vbucket map by `(vbucket, replica)`"; §4.5 "dead pipeline's address
/// on out-of-range").
#[derive(Debug, Clone)]
pub struct VbucketMap {
    partitions: usize,
    replicas: usize,
    table: Vec<i32>,
}

impl VbucketMap {
    /// `table` is row-major, `partitions` rows of `replicas + 1` entries
    /// each (replica `-1` is the active/primary, replicas `0..replicas`
    /// are replica copies, matching spec's `[P][R+1]` shape).
    pub fn new(partitions: usize, replicas: usize, table: Vec<i32>) -> MuxResult<Self> {
        if partitions == 0 {
            return Err(MuxError::InvalidArgument(
                "vbucket map must have at least one partition".into(),
            ));
        }
        if table.len() != partitions * (replicas + 1) {
            return Err(MuxError::InvalidArgument(format!(
                "vbucket map table has {} entries, expected {}x{}",
                table.len(),
                partitions,
                replicas + 1
            )));
        }
        Ok(Self {
            partitions,
            replicas,
            table,
        })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// `replica < 0` is the active copy, `replica >= 0` a replica index.
    /// Returns `None` when either coordinate is out of range; the caller
    /// maps that to the dead pipeline.
    pub fn server_for(&self, vbucket: usize, replica: i32) -> Option<i32> {
        if vbucket >= self.partitions {
            return None;
        }
        let column = if replica < 0 {
            0
        } else {
            let replica = replica as usize;
            if replica >= self.replicas {
                return None;
            }
            replica + 1
        };
        self.table.get(vbucket * (self.replicas + 1) + column).copied()
    }

    /// Every server index that owns at least one (vbucket, any-replica)
    /// slot for `server` — used by `VbucketsOnServer` (spec §9: the
    /// source's version always reads server 0's row regardless of the
    /// parameter; this one reads the requested server's column
    /// correctly).
    pub fn vbuckets_on_server(&self, server: ServerIndex) -> Vec<u32> {
        let target = server.get() as i32;
        let mut out = Vec::new();
        for vbucket in 0..self.partitions {
            let row = &self.table[vbucket * (self.replicas + 1)..(vbucket + 1) * (self.replicas + 1)];
            if row.contains(&target) {
                out.push(vbucket as u32);
            }
        }
        out
    }
}

/// A node on the ketama consistent-hash continuum (spec §3 "optional
/// ketama ring"), used for `memcached`-type buckets.
#[derive(Debug, Clone)]
pub struct KetamaRing {
    continuum: Vec<(u32, ServerIndex)>,
}

impl KetamaRing {
    /// Builds a ring from `servers`, each weighted identically with
    /// `points_per_server` continuum points, matching the classic
    /// libmemcached-compatible ketama construction (md5 the
    /// `"{address}-{point}"` label, take 4-byte chunks of the digest as
    /// continuum points).
    pub fn build(servers: &[ServerAddress], points_per_server: u32) -> MuxResult<Self> {
        if servers.is_empty() {
            return Err(MuxError::InvalidArgument(
                "ketama ring requires at least one server".into(),
            ));
        }
        let mut continuum = Vec::new();
        for (index, address) in servers.iter().enumerate() {
            for point in 0..points_per_server {
                let label = format!("{}-{}", address.as_str(), point);
                let digest = md5::compute(label.as_bytes());
                for chunk in digest.0.chunks_exact(4) {
                    let point_hash = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    continuum.push((point_hash, ServerIndex::from(index)));
                }
            }
        }
        continuum.sort_by_key(|(hash, _)| *hash);
        Ok(Self { continuum })
    }

    /// Maps `key` to the server whose continuum point is the first one
    /// at or after the key's hash, wrapping around to the first point.
    pub fn server_for(&self, key: &[u8]) -> ServerIndex {
        let digest = md5::compute(key);
        let key_hash = u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
        match self.continuum.binary_search_by_key(&key_hash, |(hash, _)| *hash) {
            Ok(idx) => self.continuum[idx].1,
            Err(idx) => {
                let idx = if idx == self.continuum.len() { 0 } else { idx };
                self.continuum[idx].1
            }
        }
    }
}

/// Endpoint addresses for an ancillary service (query, search, views,
/// ...). Opaque to routing; carried through so inspection APIs and
/// higher layers can reach them, per spec §3 "endpoint lists for
/// ancillary services".
#[derive(Debug, Clone, Default)]
pub struct AncillaryEndpoints {
    pub name: String,
    pub addresses: Vec<ServerAddress>,
}

/// Immutable topology snapshot (spec §3 "Route Config").
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub revision: u64,
    pub bucket_uuid: String,
    pub bucket_type: BucketType,
    pub kv_servers: Vec<ServerAddress>,
    pub vbucket_map: Option<VbucketMap>,
    pub ketama_ring: Option<KetamaRing>,
    pub ancillary: Vec<AncillaryEndpoints>,
    pub pool_size_per_server: usize,
}

impl RouteConfig {
    /// "A config is valid iff its network view yields a non-empty KV
    /// server list and maps are internally consistent" (spec §3).
    pub fn validate(&self) -> MuxResult<()> {
        if self.kv_servers.is_empty() {
            return Err(MuxError::InvalidArgument(
                "route config has no KV servers".into(),
            ));
        }
        match self.bucket_type {
            BucketType::Couchbase => {
                let map = self.vbucket_map.as_ref().ok_or_else(|| {
                    MuxError::InvalidArgument("couchbase bucket requires a vbucket map".into())
                })?;
                for vbucket in 0..map.partitions() {
                    if let Some(server) = map.server_for(vbucket, -1) {
                        if server >= 0 && server as usize >= self.kv_servers.len() {
                            return Err(MuxError::InvalidArgument(format!(
                                "vbucket {vbucket} maps to out-of-range server {server}"
                            )));
                        }
                    }
                }
            }
            BucketType::Memcached => {
                if self.ketama_ring.is_none() {
                    return Err(MuxError::InvalidArgument(
                        "memcached bucket requires a ketama ring".into(),
                    ));
                }
            }
            BucketType::None => {}
        }
        if self.pool_size_per_server == 0 {
            return Err(MuxError::InvalidArgument(
                "pool_size_per_server must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

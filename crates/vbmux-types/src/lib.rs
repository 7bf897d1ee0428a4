//! Shared value types for `vbmux`.
//!
//! This crate holds the small, `Copy`-friendly identifiers and enums used
//! across the routing core: server indices, vbucket ids, opaque
//! correlation ids, bucket type, and the memcached opcodes the core needs
//! to name (it never encodes them — that's the wire codec's job).

use std::fmt::{self, Display, Formatter};

/// Index of a KV server within a route config's server list.
/// Index-aligned with the config's server address list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerIndex(u32);

impl ServerIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for ServerIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ServerIndex {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<usize> for ServerIndex {
    fn from(value: usize) -> Self {
        Self(value as u32)
    }
}

impl From<ServerIndex> for u32 {
    fn from(value: ServerIndex) -> Self {
        value.0
    }
}

/// Partition id used to shard keys for `couchbase`-type buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VbucketId(u32);

impl VbucketId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for VbucketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for VbucketId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Per-request correlation id, assigned by the client and unique among
/// currently in-flight requests. Monotonically increasing within a
/// client session, which `KvMux` relies on to order redispatch after a
/// topology swap (spec: "opaque-ordered redispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Opaque(u64);

impl Opaque {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for Opaque {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Opaque {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonic source of fresh [`Opaque`] values for a single client session.
#[derive(Debug, Default)]
pub struct OpaqueGenerator {
    next: std::sync::atomic::AtomicU64,
}

impl OpaqueGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Opaque {
        Opaque(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

/// How a bucket maps keys to servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketType {
    /// Vbucket-mapped: key -> vbucket (CRC32 mod partition count) -> server.
    Couchbase,
    /// Ketama-hashed: key -> server directly via a consistent-hash ring.
    Memcached,
    /// No bucket attached; only cluster-level (GCCCP) operations are valid.
    None,
}

impl BucketType {
    pub fn is_keyed(self) -> bool {
        matches!(self, Self::Couchbase | Self::Memcached)
    }
}

/// A KV server's network address, e.g. `"10.0.0.12:11210"`. Opaque to
/// this crate beyond equality/ordering/hashing — dialing and DNS
/// resolution are the connection-string layer's job, out of scope here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerAddress(String);

impl ServerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opcode naming for the subset of operations the routing core itself
/// must recognize by name (canary no-ops and bucket attachment). Bucket
/// data operations are opaque payloads to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// `cmdNoop`: used as the circuit breaker's canary probe.
    Noop,
    /// `cmdSelectBucket`: bucket attachment handshake step.
    SelectBucket,
    /// `cmdGetClusterConfig`: GCCCP / bucket-config fetch.
    GetClusterConfig,
    /// Any bucket data operation (get/set/delete/...); the core routes by
    /// key/vbucket/replica without inspecting which one this is.
    Data(u8),
}

/// Sentinel replica index written into a request's `replica_idx` field
/// after a `DispatchDirectToAddress` call, so a subsequent retry cannot
/// silently re-route the request through the normal vbucket/ketama path.
pub const DIRECT_DISPATCH_REPLICA_SENTINEL: i32 = i32::MIN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_generator_is_monotonic_and_unique() {
        let gen = OpaqueGenerator::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a.get() < b.get());
        assert!(b.get() < c.get());
    }

    #[test]
    fn server_index_roundtrips_through_usize() {
        let idx = ServerIndex::from(3usize);
        assert_eq!(idx.as_usize(), 3);
        assert_eq!(u32::from(idx), 3);
    }

    #[test]
    fn bucket_type_keyed_classification() {
        assert!(BucketType::Couchbase.is_keyed());
        assert!(BucketType::Memcached.is_keyed());
        assert!(!BucketType::None.is_keyed());
    }
}

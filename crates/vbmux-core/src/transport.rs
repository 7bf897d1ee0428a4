//! The wire-codec seam: this crate never encodes or decodes a memcached
//! frame. A [`MemdClient`] is assumed to already speak the binary protocol
//! over one socket to one server; the core only needs to hand it requests
//! and learn when it dies.

use std::sync::Arc;

use futures::future::BoxFuture;
use vbmux_types::ServerAddress;

use crate::error::TransportError;
use crate::request::{CompletionCallback, Request};

/// A single connection to one KV server, pipelining multiple in-flight
/// requests. `send_request` only reports whether the write onto the wire
/// succeeded; the eventual response (or failure) is delivered later by
/// invoking `hook`, since a full-duplex pipelined socket can have many
/// requests outstanding before any response arrives.
#[async_trait::async_trait]
pub trait MemdClient: Send + Sync {
    /// Writes `request` onto the wire and installs `hook` to be invoked
    /// (exactly once) when its response arrives, or when the socket dies
    /// before that response does. An `Err` return means the write itself
    /// failed and `hook` was never installed/will never be called.
    async fn send_request(
        &self,
        request: Arc<Request>,
        hook: CompletionCallback,
    ) -> Result<(), TransportError>;

    /// Resolves once this client's socket has permanently stopped serving
    /// requests (read/write loop exited, whether by error or by `close`).
    /// The pipeline client's watcher task awaits this to learn when to
    /// redial.
    async fn closed(&self);

    /// Requests that this client tear down its socket. Idempotent;
    /// does not block on the teardown completing (await `closed` for
    /// that).
    fn close(&self);
}

/// Builds a connected [`MemdClient`] for one server address. Dialing,
/// authentication, and bucket selection are this factory's job and are
/// out of scope for the routing core itself.
pub type ClientFactory = Arc<
    dyn Fn(ServerAddress) -> BoxFuture<'static, Result<Arc<dyn MemdClient>, TransportError>>
        + Send
        + Sync,
>;

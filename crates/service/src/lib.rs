pub mod registry;
pub mod routing;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use codec::Frame;
use parking_lot::Mutex;

use self::registry::Registry;
pub use self::routing::{Error, Packet, Router};

pub type PeerId = u32;

/// The reserved id of the single origin server. Ids at or below this value
/// are invalid for clients.
pub const SERVER_ID: PeerId = 1;

/// The port the relay listens on by default.
pub const RELAY_PORT: u16 = 6942;

/// Records with no outbound traffic for this long get an empty frame on the
/// next keep-alive tick. The empty frame refreshes NAT bindings and doubles
/// as an idempotent re-registration echo.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

pub trait RelayHandler: Send + Sync {
    /// A registration frame bound `id` to `addr`. `renewed` is set when the
    /// id was already known and its address was silently overwritten.
    #[allow(unused_variables)]
    fn on_peer_registered(&self, id: PeerId, addr: SocketAddr, renewed: bool) {}

    /// Direct mode gave a raw sender a synthetic id keyed by its source
    /// port.
    #[allow(unused_variables)]
    fn on_direct_peer(&self, port: u16, addr: SocketAddr) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    /// Treat datagrams without the frame prefix as raw client traffic
    /// instead of dropping them.
    pub direct: bool,
}

/// Relay service.
///
/// Owns the peer registry and hands out per-socket routers. The registry is
/// shared between the receive path and the keep-alive timer, so all of its
/// state sits behind one lock and every handler runs to completion under
/// it.
#[derive(Clone)]
pub struct Relay<T> {
    registry: Arc<Mutex<Registry>>,
    options: RelayOptions,
    handler: T,
}

impl<T> Relay<T>
where
    T: RelayHandler + Clone + 'static,
{
    /// Create the relay service.
    pub fn new(options: RelayOptions, handler: T) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::new())),
            options,
            handler,
        }
    }

    /// Get a router for a socket's receive loop.
    pub fn get_router(&self) -> Router<T> {
        Router::new(
            self.registry.clone(),
            self.options,
            self.handler.clone(),
        )
    }

    /// Scan all records and produce one empty frame for every record whose
    /// last outbound traffic is at least [`KEEP_ALIVE_INTERVAL`] old. The
    /// scan refreshes the timestamp of every record it emits for, so a
    /// quiet peer receives exactly one keep-alive per interval.
    pub fn keepalives(&self, now: Instant) -> Vec<Packet> {
        let mut bytes = BytesMut::with_capacity(codec::PREAMBLE_LEN);
        let mut packets = Vec::new();

        for (id, address) in self.registry.lock().stale(now, KEEP_ALIVE_INTERVAL) {
            Frame::registration(id).encode(&mut bytes);
            packets.push(Packet {
                bytes: bytes.split().freeze(),
                target: address,
            });
        }

        packets
    }

    /// Current `id -> address` bindings, for logging and tests.
    pub fn peers(&self) -> Vec<(PeerId, SocketAddr)> {
        self.registry.lock().bindings()
    }
}

use std::net::SocketAddr;

use service::{PeerId, RelayHandler};

/// Logs registry events; non-verbose runs print nothing but these.
#[derive(Default, Clone)]
pub struct Observer;

impl RelayHandler for Observer {
    fn on_peer_registered(&self, id: PeerId, addr: SocketAddr, renewed: bool) {
        log::info!(
            "peer {}registered: id={}, addr={}",
            if renewed { "re-" } else { "" },
            id,
            addr
        );
    }

    fn on_direct_peer(&self, port: u16, addr: SocketAddr) {
        log::info!("direct peer: port={}, addr={}", port, addr);
    }
}

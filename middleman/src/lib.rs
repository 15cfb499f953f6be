pub mod interface;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use ahash::AHashMap;
use bytes::BytesMut;
use codec::Frame;
use service::{PeerId, SERVER_ID};
use tokio::{
    net::{UdpSocket, lookup_host},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

use self::interface::Interface;

/// First local port handed to a peer interface. Allocation walks upward
/// from here and never revisits a port.
pub const PORT_RANGE_START: u16 = 6970;

/// Default local port of the server application behind the shim.
pub const LISTEN_PORT: u16 = 6942;

/// Default cap on concurrent peer interfaces.
pub const PEERS_MAX: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug)]
pub enum Error {
    InvalidRole(PeerId),
    InvalidAddress(String),
    InvalidPeerId(PeerId),
    AlreadyRegistered(PeerId),
    PeerLimitReached,
    BindFailed,
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub trait MiddlemanObserver: Send + Sync {
    /// The relay address is known, either parsed or resolved.
    #[allow(unused_variables)]
    fn on_ip_resolved(&self, ip: IpAddr, port: u16) {}

    /// A peer interface came up on `local_port`.
    #[allow(unused_variables)]
    fn on_peer_registered(&self, id: PeerId, local_port: u16) {}
}

pub struct MiddlemanOptions {
    pub role: Role,
    /// Explicit peer id. A client without one derives it from a machine
    /// identifier.
    pub id: Option<PeerId>,
    /// Relay host, an IPv4 literal or a hostname to resolve.
    pub relay_host: String,
    pub relay_port: u16,
    /// Server role: local port of the application all clients reach.
    pub listen_port: u16,
    pub port_range_start: u16,
    pub max_peers: usize,
}

impl Default for MiddlemanOptions {
    fn default() -> Self {
        Self {
            role: Role::Client,
            id: None,
            relay_host: "127.0.0.1".to_string(),
            relay_port: service::RELAY_PORT,
            listen_port: LISTEN_PORT,
            port_range_start: PORT_RANGE_START,
            max_peers: PEERS_MAX,
        }
    }
}

enum Event {
    Relay(Vec<u8>, SocketAddr),
    Peer(PeerId, Vec<u8>, SocketAddr),
}

/// The peer-side shim.
///
/// One relay-bound interface multiplexes every peer onto the framed wire;
/// one peer-bound interface per remote peer presents it to the unmodified
/// local application as a plain UDP endpoint. All state lives on the event
/// loop task, socket readers only feed datagrams into its channel.
pub struct Middleman<T> {
    role: Role,
    self_id: PeerId,
    relay_address: SocketAddr,
    relay: Interface,
    peers: AHashMap<PeerId, Interface>,
    next_local_port: u16,
    listen_port: u16,
    max_peers: usize,
    observer: T,
    events: UnboundedReceiver<Event>,
    sender: UnboundedSender<Event>,
    bytes: BytesMut,
}

impl<T> Middleman<T>
where
    T: MiddlemanObserver,
{
    pub async fn new(options: MiddlemanOptions, observer: T) -> Result<Self, Error> {
        let self_id = match options.role {
            Role::Server => match options.id {
                None | Some(SERVER_ID) => SERVER_ID,
                Some(id) => return Err(Error::InvalidRole(id)),
            },
            Role::Client => match options.id {
                Some(id) if id > SERVER_ID => id,
                Some(id) => return Err(Error::InvalidRole(id)),
                None => derive_peer_id(),
            },
        };

        let relay_address = resolve(&options.relay_host, options.relay_port, &observer).await?;

        let mut relay =
            Interface::bind(self_id, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        relay.set_remote(relay_address).await?;
        relay.start().await?;

        let (sender, events) = unbounded_channel();
        spawn_reader(relay.socket(), sender.clone(), Event::Relay);

        let mut bytes = BytesMut::with_capacity(2048);
        Frame::registration(self_id).encode(&mut bytes);
        relay.send(&bytes);

        let mut middleman = Self {
            // The range never reaches into the well-known ports.
            next_local_port: options.port_range_start.max(1024),
            listen_port: options.listen_port,
            max_peers: options.max_peers,
            peers: AHashMap::new(),
            role: options.role,
            relay_address,
            self_id,
            relay,
            observer,
            events,
            sender,
            bytes,
        };

        // A client talks to exactly one remote peer, the server, and its
        // local endpoint for it exists from the start.
        if middleman.role == Role::Client {
            middleman.register_peer(middleman.self_id).await?;
        }

        Ok(middleman)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn relay_address(&self) -> SocketAddr {
        self.relay_address
    }

    /// Local port of a peer interface, the port the application talks to.
    pub fn peer_port(&self, id: PeerId) -> Option<u16> {
        self.peers.get(&id).map(|peer| peer.local_port())
    }

    /// Drive the event loop. Never returns under normal operation.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Relay(bytes, source) => self.from_relay(&bytes, source).await,
                Event::Peer(id, bytes, source) => self.from_peer(id, &bytes, source).await,
            }
        }
    }

    /// Open a local endpoint for `id`.
    ///
    /// Ports are handed out monotonically; a port that fails to bind is
    /// skipped for good and the next one is tried until the range runs
    /// out.
    pub async fn register_peer(&mut self, id: PeerId) -> Result<u16, Error> {
        if id == 0 {
            return Err(Error::InvalidPeerId(id));
        }

        if self.peers.contains_key(&id) {
            return Err(Error::AlreadyRegistered(id));
        }

        if self.peers.len() >= self.max_peers {
            return Err(Error::PeerLimitReached);
        }

        loop {
            let port = self.next_local_port;
            self.next_local_port = self.next_local_port.checked_add(1).ok_or(Error::BindFailed)?;

            let mut peer =
                match Interface::bind(id, SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await {
                    Ok(peer) => peer,
                    Err(e) => {
                        log::debug!(
                            "peer port taken, trying next: id={}, port={}, err={:?}",
                            id,
                            port,
                            e
                        );

                        continue;
                    }
                };

            if self.role == Role::Server {
                // The application endpoint is fixed in server role, so
                // the interface runs from the start.
                peer.set_remote(SocketAddr::from((Ipv4Addr::LOCALHOST, self.listen_port)))
                    .await?;
                peer.start().await?;
            }

            spawn_reader(peer.socket(), self.sender.clone(), move |bytes, source| {
                Event::Peer(id, bytes, source)
            });

            self.peers.insert(id, peer);
            self.observer.on_peer_registered(id, port);
            log::info!("peer interface registered: id={}, port={}", id, port);
            return Ok(port);
        }
    }

    /// A frame arrived on the relay interface.
    ///
    /// Coming from the relay the id field names the sender of a data
    /// frame; in empty frames it is the id whose registration is being
    /// confirmed or announced.
    async fn from_relay(&mut self, bytes: &[u8], source: SocketAddr) {
        log::debug!(
            "received from relay: addr={}, payload={:02x?}",
            source,
            bytes
        );

        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("relay datagram dropped: addr={}, reason={}", source, e);
                return;
            }
        };

        if frame.is_registration() {
            if frame.peer_id == self.self_id {
                // Keep-alive / own registration echo.
                return;
            }

            if self.role == Role::Server {
                match self.register_peer(frame.peer_id).await {
                    Ok(_) | Err(Error::AlreadyRegistered(_)) => {}
                    Err(e) => {
                        log::warn!(
                            "peer registration failed: id={}, reason={}",
                            frame.peer_id,
                            e
                        );
                    }
                }
            }

            return;
        }

        let Some(peer) = self.peers.get_mut(&frame.peer_id) else {
            log::debug!("data for unknown peer dropped: id={}", frame.peer_id);
            return;
        };

        peer.send(frame.payload);
    }

    /// A datagram arrived from the local application on a peer interface.
    async fn from_peer(&mut self, id: PeerId, payload: &[u8], source: SocketAddr) {
        log::debug!(
            "received from peer: id={}, addr={}, payload={:02x?}",
            id,
            source,
            payload
        );

        if self.role == Role::Client {
            // The first datagram out of the local application pins its
            // source port; the session stays bound to that endpoint.
            if let Some(peer) = self.peers.get_mut(&id) {
                if peer.remote().is_none() {
                    if let Err(e) = peer.set_remote(source).await {
                        log::warn!("peer connect failed: id={}, err={:?}", id, e);
                        return;
                    }

                    if let Err(e) = peer.start().await {
                        log::warn!("peer start failed: id={}, err={:?}", id, e);
                        return;
                    }
                }
            }
        }

        // The server's application answers many clients, so outbound
        // frames name the client the datagram came in for; a client's
        // application only ever talks to the server.
        let receiver = match self.role {
            Role::Server => id,
            Role::Client => SERVER_ID,
        };

        Frame {
            peer_id: receiver,
            payload,
        }
        .encode(&mut self.bytes);

        self.relay.send(&self.bytes);
    }
}

fn spawn_reader<F>(socket: Arc<UdpSocket>, sender: UnboundedSender<Event>, make: F)
where
    F: Fn(Vec<u8>, SocketAddr) -> Event + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];

        loop {
            let (size, source) = match socket.recv_from(&mut buf).await {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    log::warn!("udp socket receive error: {:?}", e);
                    continue;
                }
            };

            if sender.send(make(buf[..size].to_vec(), source)).is_err() {
                break;
            }
        }
    });
}

async fn resolve<T>(host: &str, port: u16, observer: &T) -> Result<SocketAddr, Error>
where
    T: MiddlemanObserver,
{
    // An IPv4 literal starts immediately, anything else goes through the
    // resolver. IPv6 is not carried on this wire.
    let address = if let Ok(ip) = host.parse::<Ipv4Addr>() {
        SocketAddr::from((ip, port))
    } else {
        lookup_host((host, port))
            .await
            .map_err(|_| Error::InvalidAddress(host.to_string()))?
            .find(|address| address.is_ipv4())
            .ok_or_else(|| Error::InvalidAddress(host.to_string()))?
    };

    observer.on_ip_resolved(address.ip(), address.port());
    Ok(address)
}

/// Hash a machine identifier down to 32 bits for clients that did not pick
/// an id, re-hashing away from the reserved values.
fn derive_peer_id() -> PeerId {
    let machine = std::fs::read_to_string("/etc/machine-id")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| std::process::id().to_string());

    let mut id = crc32fast::hash(machine.trim().as_bytes());
    while id <= SERVER_ID {
        id = crc32fast::hash(&id.to_be_bytes());
    }

    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_is_never_reserved() {
        assert!(derive_peer_id() > SERVER_ID);
    }
}

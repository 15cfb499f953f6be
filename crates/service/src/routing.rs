use std::{net::SocketAddr, sync::Arc, time::Instant};

use bytes::{Bytes, BytesMut};
use codec::Frame;
use parking_lot::Mutex;

use crate::{PeerId, RelayHandler, RelayOptions, SERVER_ID, registry::Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidFrame(codec::Error),
    UnknownPeer(PeerId),
    ServerNotRegistered,
    SenderNotRegistered(SocketAddr),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::InvalidFrame(value)
    }
}

/// One datagram to put on the wire.
#[derive(Debug, Clone)]
pub struct Packet {
    pub bytes: Bytes,
    pub target: SocketAddr,
}

/// Per-socket router.
///
/// Holds its own scratch buffer so the receive loop re-encodes frames
/// without allocating a fresh buffer per datagram. All registry access
/// happens under the shared lock, one datagram at a time.
pub struct Router<T> {
    registry: Arc<Mutex<Registry>>,
    options: RelayOptions,
    handler: T,
    bytes: BytesMut,
}

impl<T> Router<T>
where
    T: RelayHandler,
{
    pub(crate) fn new(registry: Arc<Mutex<Registry>>, options: RelayOptions, handler: T) -> Self {
        Self {
            bytes: BytesMut::with_capacity(2048),
            registry,
            options,
            handler,
        }
    }

    /// Route one inbound datagram, producing up to two outbound packets.
    ///
    /// The id field of a frame changes meaning with its payload: an empty
    /// payload makes it the sender announcing itself, a non-empty payload
    /// makes it the receiver the sender wants to reach. Datagrams that do
    /// not decode are dropped, unless direct mode turns them into raw
    /// client traffic.
    pub fn route(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Packet>, Error> {
        match Frame::decode(bytes) {
            Ok(frame) if frame.is_registration() => self.register(frame.peer_id, source, now),
            Ok(frame) => self.forward(frame, bytes, source, now),
            Err(_) if self.options.direct => self.direct(bytes, source, now),
            Err(e) => Err(e.into()),
        }
    }

    /// Bind the sender's address to the id it announced.
    ///
    /// The server has to be first: client registrations arriving earlier
    /// are dropped without touching the map. Re-registration overwrites
    /// the previous address silently, the protocol carries no leases.
    fn register(
        &mut self,
        id: PeerId,
        source: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Packet>, Error> {
        let mut registry = self.registry.lock();
        let mut packets = Vec::with_capacity(2);

        if id != SERVER_ID {
            let server = registry
                .server()
                .ok_or(Error::ServerNotRegistered)?
                .address;

            // Tell the server a new client exists so its middleman can
            // open a local endpoint for it.
            Frame::registration(id).encode(&mut self.bytes);
            packets.push(Packet {
                bytes: self.bytes.split().freeze(),
                target: server,
            });

            registry.touch(SERVER_ID, now);
        }

        let renewed = registry.insert(id, source, now);

        // The confirmation doubles as the NAT punch toward the new peer.
        Frame::registration(id).encode(&mut self.bytes);
        packets.push(Packet {
            bytes: self.bytes.split().freeze(),
            target: source,
        });

        drop(registry);
        self.handler.on_peer_registered(id, source, renewed);
        Ok(packets)
    }

    /// Forward a data frame to the receiver named in its id field.
    fn forward(
        &mut self,
        frame: Frame<'_>,
        raw: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Packet>, Error> {
        let mut registry = self.registry.lock();

        let Some(receiver) = registry.get(frame.peer_id).map(|record| record.address) else {
            // In direct mode the server addresses raw clients by the
            // pseudo id made from their source port; those frames leave
            // the relay unwrapped.
            if self.options.direct && frame.peer_id <= u16::MAX as u32 {
                if let Some(address) = registry.direct_address(frame.peer_id as u16) {
                    return Ok(vec![Packet {
                        bytes: Bytes::copy_from_slice(frame.payload),
                        target: address,
                    }]);
                }
            }

            return Err(Error::UnknownPeer(frame.peer_id));
        };

        if frame.peer_id != SERVER_ID {
            // Server to client: the id already names the receiver, the
            // datagram passes through verbatim.
            registry.touch(frame.peer_id, now);

            Ok(vec![Packet {
                bytes: Bytes::copy_from_slice(raw),
                target: receiver,
            }])
        } else {
            // Client to server: rewrite the id field so the server learns
            // which client is talking.
            let sender = registry
                .id_of(&source)
                .ok_or(Error::SenderNotRegistered(source))?;

            Frame {
                peer_id: sender,
                payload: frame.payload,
            }
            .encode(&mut self.bytes);

            registry.touch(SERVER_ID, now);

            Ok(vec![Packet {
                bytes: self.bytes.split().freeze(),
                target: receiver,
            }])
        }
    }

    /// Direct mode: an unframed datagram is raw client traffic. The source
    /// port becomes the pseudo id, the server is notified once, and the
    /// raw bytes travel on wrapped in a regular data frame.
    fn direct(
        &mut self,
        raw: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Packet>, Error> {
        let mut registry = self.registry.lock();
        let server = registry
            .server()
            .ok_or(Error::ServerNotRegistered)?
            .address;

        let port = source.port();
        let mut packets = Vec::with_capacity(2);
        let first_sighting = registry.insert_direct(port, source);

        if first_sighting {
            Frame::registration(port as u32).encode(&mut self.bytes);
            packets.push(Packet {
                bytes: self.bytes.split().freeze(),
                target: server,
            });
        }

        Frame {
            peer_id: port as u32,
            payload: raw,
        }
        .encode(&mut self.bytes);

        packets.push(Packet {
            bytes: self.bytes.split().freeze(),
            target: server,
        });

        registry.touch(SERVER_ID, now);
        drop(registry);

        if first_sighting {
            self.handler.on_direct_peer(port, source);
        }

        Ok(packets)
    }
}

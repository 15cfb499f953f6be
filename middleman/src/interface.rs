use std::{collections::VecDeque, io, net::SocketAddr, sync::Arc};

use service::PeerId;
use tokio::net::UdpSocket;

/// Cap on datagrams parked while an interface is not yet running. Overflow
/// drops the oldest entry first.
const QUEUE_LIMIT: usize = 1024;

/// One UDP socket facing either the relay or a local application endpoint.
///
/// Writes are best-effort datagram semantics end to end: while the
/// interface is not running they park in a bounded FIFO, and once running
/// they go out with a non-blocking send. A send that would block is dropped
/// like any other lost datagram.
pub struct Interface {
    id: PeerId,
    socket: Arc<UdpSocket>,
    local_port: u16,
    remote: Option<SocketAddr>,
    running: bool,
    queue: VecDeque<Vec<u8>>,
}

impl Interface {
    /// Bind the socket. The remote endpoint may be learned later.
    pub async fn bind(id: PeerId, bind: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        let local_port = socket.local_addr()?.port();

        Ok(Self {
            socket: Arc::new(socket),
            queue: VecDeque::new(),
            running: false,
            remote: None,
            local_port,
            id,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// A clone of the underlying socket for a receive loop.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Learn or change the remote endpoint. A running interface reconnects
    /// immediately, otherwise the new remote takes effect on start.
    pub async fn set_remote(&mut self, remote: SocketAddr) -> io::Result<()> {
        self.remote = Some(remote);

        if self.running {
            self.socket.connect(remote).await?;
        }

        Ok(())
    }

    /// Connect to the remote when one is known, mark the interface
    /// running, and flush everything parked in the queue, oldest first.
    pub async fn start(&mut self) -> io::Result<()> {
        if let Some(remote) = self.remote {
            self.socket.connect(remote).await?;
        }

        self.running = true;
        while let Some(bytes) = self.queue.pop_front() {
            self.transmit(&bytes);
        }

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Queue while stopped, transmit while running.
    pub fn send(&mut self, bytes: &[u8]) {
        if !self.running {
            if self.queue.len() == QUEUE_LIMIT {
                self.queue.pop_front();
            }

            self.queue.push_back(bytes.to_vec());
            return;
        }

        self.transmit(bytes);
    }

    fn transmit(&self, bytes: &[u8]) {
        let Some(remote) = self.remote else {
            log::warn!("interface has no remote endpoint: id={}", self.id);
            return;
        };

        match self.socket.try_send_to(bytes, remote) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::warn!(
                    "interface send would block: id={}, dropped={} bytes",
                    self.id,
                    bytes.len()
                );
            }
            Err(e) => {
                log::warn!("interface send error: id={}, err={:?}", self.id, e);
            }
        }
    }
}

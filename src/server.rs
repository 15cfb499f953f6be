use std::{net::SocketAddr, sync::Arc, time::Instant};

use service::{KEEP_ALIVE_INTERVAL, Relay, RelayHandler, Router};
use tokio::{net::UdpSocket, time};

use crate::config::Config;

/// Start the relay on its single socket.
///
/// One task drains the socket and routes datagram by datagram, preserving
/// per-socket receive order; a second task ticks the keep-alive scan.
/// Returns the bound address once the socket is up.
pub async fn run<T>(config: Arc<Config>, relay: &Relay<T>) -> anyhow::Result<SocketAddr>
where
    T: RelayHandler + Clone + 'static,
{
    let socket = Arc::new(UdpSocket::bind(config.bind).await?);
    let local_addr = socket.local_addr()?;

    tokio::spawn(recv_loop(relay.get_router(), socket.clone()));
    tokio::spawn(keepalive_loop(relay.clone(), socket));

    log::info!(
        "relay listening: addr={}, direct={}",
        local_addr,
        config.direct
    );

    Ok(local_addr)
}

/// Read datagrams off the socket and put the routed packets back on it.
/// Per-datagram failures are drops, never terminations.
async fn recv_loop<T>(mut router: Router<T>, socket: Arc<UdpSocket>)
where
    T: RelayHandler,
{
    let mut buf = vec![0u8; 4096];

    loop {
        let (size, source) = match socket.recv_from(&mut buf).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("udp socket receive error: {:?}", e);
                continue;
            }
        };

        log::debug!(
            "udp socket receive: addr={}, payload={:02x?}",
            source,
            &buf[..size]
        );

        match router.route(&buf[..size], source, Instant::now()) {
            Ok(packets) => {
                for packet in packets {
                    if let Err(e) = socket.send_to(&packet.bytes, packet.target).await {
                        log::warn!(
                            "udp socket send error: addr={}, err={:?}",
                            packet.target,
                            e
                        );
                    }
                }
            }
            Err(e) => {
                log::debug!("datagram dropped: addr={}, reason={}", source, e);
            }
        }
    }
}

/// Tick once a second and refresh every record the scan reports stale.
async fn keepalive_loop<T>(relay: Relay<T>, socket: Arc<UdpSocket>)
where
    T: RelayHandler + Clone + 'static,
{
    let mut interval = time::interval(KEEP_ALIVE_INTERVAL);

    loop {
        interval.tick().await;

        for packet in relay.keepalives(Instant::now()) {
            log::debug!("keep-alive: addr={}", packet.target);

            if let Err(e) = socket.send_to(&packet.bytes, packet.target).await {
                log::warn!(
                    "udp socket send error: addr={}, err={:?}",
                    packet.target,
                    e
                );
            }
        }
    }
}

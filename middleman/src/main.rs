mod config;

use std::net::IpAddr;

use uturn_middleman::{Middleman, MiddlemanObserver, MiddlemanOptions, Role};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

struct Logger;

impl MiddlemanObserver for Logger {
    fn on_ip_resolved(&self, ip: IpAddr, port: u16) {
        log::info!("relay address resolved: ip={}, port={}", ip, port);
    }

    fn on_peer_registered(&self, id: u32, local_port: u16) {
        log::info!("peer endpoint open: id={}, port={}", id, local_port);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let middleman = Middleman::new(
        MiddlemanOptions {
            role: if config.server {
                Role::Server
            } else {
                Role::Client
            },
            id: config.id,
            relay_host: config.relay_ip,
            relay_port: config.relay_port,
            listen_port: config.listen_port,
            port_range_start: config.port_range_start,
            max_peers: config.max_peers,
        },
        Logger,
    )
    .await?;

    log::info!(
        "middleman running: role={:?}, id={}, relay={}",
        middleman.role(),
        middleman.self_id(),
        middleman.relay_address(),
    );

    tokio::select! {
        _ = middleman.run() => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    Ok(())
}

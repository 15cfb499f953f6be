pub mod config;
pub mod observer;
pub mod server;

use std::{net::SocketAddr, sync::Arc};

use service::{Relay, RelayOptions};

use self::{config::Config, observer::Observer};

/// Boot the relay and return its bound address. Integration tests start
/// the server in-process through this instead of the main function.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<SocketAddr> {
    let relay = Relay::new(
        RelayOptions {
            direct: config.direct,
        },
        Observer,
    );

    server::run(config, &relay).await
}

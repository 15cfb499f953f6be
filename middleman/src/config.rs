use std::fs::read_to_string;

use clap::Parser;
use serde::Deserialize;
use uturn_middleman::{LISTEN_PORT, PEERS_MAX, PORT_RANGE_START};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// shim role
    ///
    /// The server-side shim sits next to the origin server application and
    /// opens one local endpoint per client; the client-side shim (the
    /// default) presents the origin server on a single local endpoint.
    #[serde(default)]
    pub server: bool,

    /// peer id
    ///
    /// The server role owns the reserved id; a client without an explicit
    /// id derives one from a machine identifier.
    #[serde(default)]
    pub id: Option<u32>,

    /// server application port
    ///
    /// Server role only: the local UDP port the origin server application
    /// listens on. Every peer interface forwards inbound traffic there.
    #[serde(default = "Config::listen_port")]
    pub listen_port: u16,

    /// relay host
    ///
    /// An IPv4 literal or a hostname. Hostnames are resolved before the
    /// shim starts.
    #[serde(default = "Config::relay_ip")]
    pub relay_ip: String,

    #[serde(default = "Config::relay_port")]
    pub relay_port: u16,

    /// first local peer port
    ///
    /// Peer interfaces bind consecutive ports starting here.
    #[serde(default = "Config::port_range_start")]
    pub port_range_start: u16,

    /// peer limit
    ///
    /// Registrations past this count are refused.
    #[serde(default = "Config::max_peers")]
    pub max_peers: usize,

    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn listen_port() -> u16 {
        LISTEN_PORT
    }

    fn relay_ip() -> String {
        "127.0.0.1".to_string()
    }

    fn relay_port() -> u16 {
        service::RELAY_PORT
    }

    fn port_range_start() -> u16 {
        PORT_RANGE_START
    }

    fn max_peers() -> usize {
        PEERS_MAX
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// act as the origin server's shim.
    #[arg(short, long)]
    server: bool,

    /// peer id, derived from a machine identifier when omitted.
    #[arg(short, long)]
    id: Option<u32>,

    /// local port of the server application (server role).
    #[arg(short, long)]
    listen_port: Option<u16>,

    /// relay host, an IPv4 literal or a hostname.
    #[arg(short, long)]
    relay_ip: Option<String>,

    /// relay port.
    #[arg(short = 'p', long)]
    relay_port: Option<u16>,

    /// log every datagram with its hex payload.
    #[arg(short, long)]
    verbose: bool,

    /// configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters on top of the optional configuration
    /// file; flags win over file values.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let cfg_str = cli
            .config
            .map(read_to_string)
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());

        let mut config: Config = serde_json5::from_str(&cfg_str)
            .map_err(|e| anyhow::anyhow!("read config file failed: {}", e))?;

        if cli.server {
            config.server = true;
        }

        if let Some(id) = cli.id {
            config.id = Some(id);
        }

        if let Some(port) = cli.listen_port {
            config.listen_port = port;
        }

        if let Some(host) = cli.relay_ip {
            config.relay_ip = host;
        }

        if let Some(port) = cli.relay_port {
            config.relay_port = port;
        }

        if cli.verbose {
            config.log.level = LogLevel::Debug;
        }

        Ok(config)
    }
}

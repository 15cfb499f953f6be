use std::{fs::read_to_string, net::SocketAddr};

use clap::Parser;
use serde::Deserialize;

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
    /// relay listen address
    ///
    /// The address and port bound by the UDP socket. A single socket
    /// carries registrations, framed data and, in direct mode, raw client
    /// traffic.
    #[serde(default = "Config::bind")]
    pub bind: SocketAddr,

    /// direct mode
    ///
    /// Accept datagrams without the frame prefix as raw client traffic,
    /// keyed by their UDP source port.
    #[serde(default)]
    pub direct: bool,

    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn bind() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], service::RELAY_PORT))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Self::bind(),
            direct: false,
            log: Log::default(),
        }
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// UDP port the relay listens on.
    #[arg(short, long)]
    port: Option<u16>,

    /// log every datagram with its hex payload.
    #[arg(short, long)]
    verbose: bool,

    /// accept unframed datagrams as raw client traffic.
    #[arg(short, long)]
    direct: bool,

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

        if let Some(port) = cli.port {
            config.bind.set_port(port);
        }

        if cli.direct {
            config.direct = true;
        }

        if cli.verbose {
            config.log.level = LogLevel::Debug;
        }

        Ok(config)
    }
}

use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use service::StackConfig;

/// One packet port: a UDP socket standing in for a link on a named
/// interface.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Interface {
    ///
    /// interface name
    ///
    /// Used by migration directives that select flows by interface.
    ///
    pub name: String,
    ///
    /// bind address
    ///
    /// The address and port this packet port reads frames from.
    ///
    pub listen: SocketAddr,
    ///
    /// interface index
    ///
    /// Stamped into target entries and statistics for this port.
    ///
    pub if_index: u32,
    ///
    /// Maximum Transmission Unit (MTU) size for network packets.
    ///
    #[serde(default = "Interface::mtu")]
    pub mtu: usize,
}

impl Interface {
    fn mtu() -> usize {
        1500
    }
}

/// Resolver control socket settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ctrl {
    ///
    /// control socket path
    ///
    /// The well-known local datagram socket the resolver talks to.
    ///
    #[serde(default = "Ctrl::path")]
    pub path: String,
    ///
    /// transit capability
    ///
    /// When set, the stack resolves and forwards packets for services it
    /// does not terminate.
    ///
    #[serde(default)]
    pub transit: bool,
}

impl Ctrl {
    fn path() -> String {
        codec::ctrl::CTRL_SOCKET_PATH.to_string()
    }
}

impl Default for Ctrl {
    fn default() -> Self {
        Self {
            path: Self::path(),
            transit: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
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

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// stack tunables
    ///
    /// SAL retransmission, RTO bounds, buffer sizes and memory limits;
    /// unset fields take the protocol defaults.
    ///
    #[serde(default)]
    pub stack: StackConfig,
    ///
    /// packet ports
    ///
    /// The interfaces the stack reads frames from. Without any, the
    /// daemon has nothing to do.
    ///
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    ///
    /// stack port
    ///
    /// The UDP port peers address their frames to.
    ///
    #[serde(default = "Config::port")]
    pub port: u16,
    ///
    /// Maximum number of worker tasks per packet port.
    ///
    #[serde(default = "Config::max_threads")]
    pub max_threads: usize,
    #[serde(default)]
    pub ctrl: Ctrl,
    #[serde(default)]
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack: StackConfig::default(),
            interfaces: Vec::new(),
            port: Self::port(),
            max_threads: Self::max_threads(),
            ctrl: Ctrl::default(),
            log: Log::default(),
        }
    }
}

impl Config {
    fn port() -> u16 {
        7472
    }

    fn max_threads() -> usize {
        num_cpus::get()
    }

    /// The source address announced in resolver upcalls: the first
    /// interface's address.
    pub fn local_addr(&self) -> std::net::Ipv4Addr {
        self.interfaces
            .first()
            .and_then(|interface| match interface.listen.ip() {
                std::net::IpAddr::V4(addr) => Some(addr),
                _ => None,
            })
            .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED)
    }

    /// Map an interface name to its index.
    pub fn if_index_by_name(&self, name: &str) -> Option<u32> {
        self.interfaces
            .iter()
            .find(|interface| interface.name == name)
            .map(|interface| interface.if_index)
    }

    /// The address bound to an interface index.
    pub fn addr_by_if_index(&self, if_index: u32) -> Option<std::net::Ipv4Addr> {
        self.interfaces
            .iter()
            .find(|interface| interface.if_index == if_index)
            .and_then(|interface| match interface.listen.ip() {
                std::net::IpAddr::V4(addr) => Some(addr),
                _ => None,
            })
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: svc-stack --config /etc/svc-stack/config.json
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str::<Self>(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}

use std::{fs::read_to_string, net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    ///
    /// admin server listen
    ///
    /// This option specifies the binding address of the admin surface
    /// used to inspect and edit the forwarding rules. It carries no
    /// authentication, do not expose it directly to an unsafe
    /// environment.
    ///
    #[serde(default = "Api::bind")]
    pub bind: SocketAddr,
}

impl Api {
    fn bind() -> SocketAddr {
        "127.0.0.1:9090".parse().unwrap()
    }
}

impl Default for Api {
    fn default() -> Self {
        Self { bind: Self::bind() }
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
    /// broker listen
    ///
    /// The address the transit broker binds. Backends register their
    /// persistent connections here and external clients connect here;
    /// the two are told apart by their remote address, so a single port
    /// serves both.
    ///
    #[serde(default = "Config::listen")]
    pub listen: SocketAddr,
    ///
    /// rule store path
    ///
    /// A JSON object mapping match keys (one or more source IPs joined
    /// by `;`) to the `host:port` a backend dials from. The file is
    /// rewritten by the admin surface on every rule edit.
    ///
    #[serde(default = "Config::rules")]
    pub rules: PathBuf,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn listen() -> SocketAddr {
        "0.0.0.0:8000".parse().unwrap()
    }

    fn rules() -> PathBuf {
        "./config.json".into()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            rules: Self::rules(),
            api: Api::default(),
            log: Log::default(),
        }
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
    /// Example: transit-server --config /etc/transit/config.toml
    ///
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is
    /// read from the configuration file, otherwise the default
    /// configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default end-of-upload marker. Clients that cannot close their write side
/// (plain netcat on some platforms) append this to signal completion.
pub const DEFAULT_TERMINATOR: &str = "termsend\n";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Addresses to bind listening sockets on. Each address is combined
    /// with every enabled port role, so two addresses and three enabled
    /// ports produce six listening sockets.
    pub bind_ip: Vec<IpAddr>,
    /// Plain upload port. 0 disables the role.
    pub listen_port: u16,
    /// TLS upload port. 0 disables the role.
    pub tls_port: u16,
    /// Timed-mode plain port, where an inactivity gap completes the upload
    /// instead of aborting it. 0 disables the role.
    pub timed_port: u16,
    /// Timed-mode TLS port. 0 disables the role.
    pub timed_tls_port: u16,
    /// Maximum payload size in bytes, not counting the terminator.
    pub max_size: u64,
    /// Upload slot count; connections past this limit are turned away.
    pub max_connections: usize,
    /// Seconds of client silence tolerated on ordinary ports.
    pub max_timeout: u64,
    /// Seconds of client silence that complete an upload on timed ports.
    pub timed_max_timeout: u64,
    /// End-of-upload marker looked for in the byte stream.
    pub terminator: String,
    /// Directory uploaded files are stored in. Must exist.
    pub output_dir: PathBuf,
    /// Host part of download links sent back to clients.
    pub domain: String,
    /// Query log: one line per finished connection. None disables it.
    pub query_log: Option<PathBuf>,
    /// File with one dotted-quad per line, consulted per `list_mode`.
    pub list_file: Option<PathBuf>,
    pub list_mode: ListMode,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            listen_port: 1337,
            tls_port: 0,
            timed_port: 0,
            timed_tls_port: 0,
            max_size: 1024 * 1024, // 1 MiB
            max_connections: 10,
            max_timeout: 60,
            timed_max_timeout: 5,
            terminator: DEFAULT_TERMINATOR.to_string(),
            output_dir: PathBuf::from("/var/lib/nightjar"),
            domain: "localhost".to_string(),
            query_log: None,
            list_file: None,
            list_mode: ListMode::Disabled,
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Which way the address list is interpreted at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    /// Every address is allowed; the list file is ignored.
    Disabled,
    /// Only listed addresses may upload.
    Whitelist,
    /// Listed addresses may not upload.
    Blacklist,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file with the server certificate chain.
    pub cert_file: Option<PathBuf>,
    /// PEM file with the PKCS#8 private key.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub colorful_output: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            colorful_output: false,
            file: None,
        }
    }
}

impl Config {
    /// Ports that are actually enabled, as (port, role) pairs.
    pub fn enabled_ports(&self) -> Vec<(u16, PortRole)> {
        [
            (self.listen_port, PortRole::Plain),
            (self.tls_port, PortRole::Tls),
            (self.timed_port, PortRole::TimedPlain),
            (self.timed_tls_port, PortRole::TimedTls),
        ]
        .into_iter()
        .filter(|(port, _)| *port != 0)
        .collect()
    }

    fn wants_tls(&self) -> bool {
        self.tls_port != 0 || self.timed_tls_port != 0
    }
}

/// Role a listening port plays. Timed roles treat an inactivity gap as
/// end-of-upload instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Plain,
    Tls,
    TimedPlain,
    TimedTls,
}

impl PortRole {
    pub fn is_tls(self) -> bool {
        matches!(self, PortRole::Tls | PortRole::TimedTls)
    }

    pub fn is_timed(self) -> bool {
        matches!(self, PortRole::TimedPlain | PortRole::TimedTls)
    }
}

pub fn load_config(path: &std::path::Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &Config) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("couldn't serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    let ports = config.enabled_ports();

    if ports.is_empty() {
        return Err(Error::Config(
            "no listening ports configured; enable at least one of listen_port, \
            tls_port, timed_port, timed_tls_port"
                .to_string(),
        ));
    }

    for (i, (port, _)) in ports.iter().enumerate() {
        if ports[i + 1..].iter().any(|(other, _)| other == port) {
            return Err(Error::Config(format!(
                "port {} is assigned to more than one role",
                port
            )));
        }
    }

    if config.bind_ip.is_empty() {
        return Err(Error::Config("bind_ip must not be empty".to_string()));
    }

    if config.max_size == 0 {
        return Err(Error::Config("max_size must be non-zero".to_string()));
    }

    if config.max_connections == 0 {
        return Err(Error::Config("max_connections must be non-zero".to_string()));
    }

    if config.max_timeout == 0 {
        return Err(Error::Config("max_timeout must be non-zero".to_string()));
    }

    if (config.timed_port != 0 || config.timed_tls_port != 0) && config.timed_max_timeout == 0 {
        return Err(Error::Config(
            "timed ports are enabled but timed_max_timeout is zero".to_string(),
        ));
    }

    if config.terminator.is_empty() {
        return Err(Error::Config("terminator must not be empty".to_string()));
    }

    if config.domain.is_empty() {
        return Err(Error::Config("domain must not be empty".to_string()));
    }

    match std::fs::metadata(&config.output_dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(Error::Config(format!(
                "output_dir {} is not a directory",
                config.output_dir.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Config(format!(
                "output_dir {} does not exist; create it or adjust config",
                config.output_dir.display()
            )));
        }
        Err(e) => return Err(Error::Io(e)),
    }

    if config.wants_tls() {
        if config.tls.cert_file.is_none() {
            return Err(Error::Config(
                "a TLS port is enabled but tls.cert_file is not set".to_string(),
            ));
        }
        if config.tls.key_file.is_none() {
            return Err(Error::Config(
                "a TLS port is enabled but tls.key_file is not set".to_string(),
            ));
        }
    }

    Ok(())
}

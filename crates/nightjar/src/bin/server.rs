//! Nightjar server binary.
//!
//! Merges the TOML config file with command-line overrides, sets up
//! logging, and runs the server until the process is signalled. The first
//! SIGINT/SIGTERM drains in-flight uploads; a second one force-quits.

use clap::Parser;
use nightjar::config::{self, Config, ListMode};
use nightjar::{Error, Server};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nightjar-server", about = "Anonymous upload server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/nightjar/nightjar.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Addresses to bind listening sockets on
    #[arg(long)]
    bind: Option<Vec<IpAddr>>,

    /// Plain upload port (0 disables)
    #[arg(long)]
    port: Option<u16>,

    /// TLS upload port (0 disables)
    #[arg(long)]
    tls_port: Option<u16>,

    /// Timed-mode plain port (0 disables)
    #[arg(long)]
    timed_port: Option<u16>,

    /// Timed-mode TLS port (0 disables)
    #[arg(long)]
    timed_tls_port: Option<u16>,

    /// Maximum payload size in bytes
    #[arg(long)]
    max_size: Option<u64>,

    /// Number of upload slots
    #[arg(long)]
    max_connections: Option<usize>,

    /// Inactivity limit on ordinary ports, in seconds
    #[arg(long)]
    max_timeout: Option<u64>,

    /// Silence that completes an upload on timed ports, in seconds
    #[arg(long)]
    timed_max_timeout: Option<u64>,

    /// Directory uploaded files are stored in
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Host part of download links
    #[arg(long)]
    domain: Option<String>,

    /// Query log path
    #[arg(long)]
    query_log: Option<PathBuf>,

    /// Address list file for whitelist/blacklist filtering
    #[arg(long)]
    list_file: Option<PathBuf>,

    /// How the address list is interpreted
    #[arg(long, value_enum)]
    list_mode: Option<ListMode>,

    /// TLS certificate chain (PEM)
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// TLS private key (PEM, PKCS#8)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Program log file (default: stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(ref bind) = cli.bind {
        config.bind_ip = bind.clone();
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(port) = cli.tls_port {
        config.tls_port = port;
    }
    if let Some(port) = cli.timed_port {
        config.timed_port = port;
    }
    if let Some(port) = cli.timed_tls_port {
        config.timed_tls_port = port;
    }
    if let Some(max_size) = cli.max_size {
        config.max_size = max_size;
    }
    if let Some(max_connections) = cli.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(max_timeout) = cli.max_timeout {
        config.max_timeout = max_timeout;
    }
    if let Some(timed_max_timeout) = cli.timed_max_timeout {
        config.timed_max_timeout = timed_max_timeout;
    }
    if let Some(ref output_dir) = cli.output_dir {
        config.output_dir = output_dir.clone();
    }
    if let Some(ref domain) = cli.domain {
        config.domain = domain.clone();
    }
    if let Some(ref query_log) = cli.query_log {
        config.query_log = Some(query_log.clone());
    }
    if let Some(ref list_file) = cli.list_file {
        config.list_file = Some(list_file.clone());
    }
    if let Some(list_mode) = cli.list_mode {
        config.list_mode = list_mode;
    }
    if let Some(ref cert_file) = cli.cert_file {
        config.tls.cert_file = Some(cert_file.clone());
    }
    if let Some(ref key_file) = cli.key_file {
        config.tls.key_file = Some(key_file.clone());
    }
    if let Some(ref log_file) = cli.log_file {
        config.logging.file = Some(log_file.clone());
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
}

fn log_effective_config(config: &Config) {
    info!("bind_ip           {:?}", config.bind_ip);
    info!("listen_port       {}", config.listen_port);
    info!("tls_port          {}", config.tls_port);
    info!("timed_port        {}", config.timed_port);
    info!("timed_tls_port    {}", config.timed_tls_port);
    info!("max_size          {}", config.max_size);
    info!("max_connections   {}", config.max_connections);
    info!("max_timeout       {}", config.max_timeout);
    info!("timed_max_timeout {}", config.timed_max_timeout);
    info!("terminator        {:?}", config.terminator);
    info!("output_dir        {}", config.output_dir.display());
    info!("domain            {}", config.domain);
    info!("list_mode         {:?}", config.list_mode);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        Config::default()
    };
    apply_overrides(&mut config, &cli);

    if cli.init_config {
        config::write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        config::validate_config(&config)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    let _log_guard = if let Some(ref log_file) = config.logging.file {
        let dir = match log_file.parent() {
            Some(path) if path.as_os_str().is_empty() => std::path::Path::new("."),
            Some(path) => path,
            None => std::path::Path::new("."),
        };
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::Config("log_file must include a file name".to_string()))?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(config.logging.level.clone()))
            .with_ansi(false)
            .with_writer(non_blocking)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(config.logging.level.clone()))
            .with_ansi(config.logging.colorful_output)
            .init();

        None
    };

    log_effective_config(&config);

    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut term, mut int) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                warn!("couldn't install signal handlers, ctrl-c will be abrupt");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        info!("shutdown requested, draining connections (signal again to force quit)");
        shutdown.graceful();

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        warn!("force quit requested");
        shutdown.force();
    });

    server.run().await?;
    Ok(())
}

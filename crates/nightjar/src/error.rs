use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced during startup and configuration.
///
/// Per-session failures (read errors, oversized uploads, inactivity) never
/// reach this type; they terminate only the affected connection and are
/// reported through the query log.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ip filtering requested but no list file configured")]
    ListMissing,

    #[error("malformed address '{token}' in list file on line {line}")]
    ListParse { line: usize, token: String },

    #[error("TLS setup error: {0}")]
    Tls(String),

    #[error("couldn't bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("couldn't open query log {path}: {source}")]
    QueryLog {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

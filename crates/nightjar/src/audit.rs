//! Query log: one line per finished connection.
//!
//! Every connection that reaches accept ends up here exactly once, either
//! with the name of the stored file or with the reason it was turned away.
//! The format is `[client-ip] outcome`, append-only, for operators who want
//! a flat answer to "who uploaded what" without digging through the program
//! log.

use std::fmt;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Terminal outcome of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<'a> {
    /// Upload finished; payload lives under this name.
    Stored(&'a str),
    NotAllowed,
    ConnectionLimit,
    HandshakeError,
    OpenError,
    Inactivity,
    ReadError,
    WriteError,
    TooBig,
    NoData,
}

impl fmt::Display for Outcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Stored(name) => write!(f, "{}", name),
            Outcome::NotAllowed => write!(f, "rejected: not allowed"),
            Outcome::ConnectionLimit => write!(f, "rejected: connection limit"),
            Outcome::HandshakeError => write!(f, "rejected: handshake error"),
            Outcome::OpenError => write!(f, "rejected: file open error"),
            Outcome::Inactivity => write!(f, "rejected: inactivity"),
            Outcome::ReadError => write!(f, "rejected: read error"),
            Outcome::WriteError => write!(f, "rejected: write to file failed"),
            Outcome::TooBig => write!(f, "rejected: file too big"),
            Outcome::NoData => write!(f, "rejected: no data"),
        }
    }
}

/// Append-only sink for connection outcomes.
///
/// Cloning shares the underlying file. With no path configured the sink is
/// disabled and events only show up in the program log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    sink: Option<Arc<Mutex<std::fs::File>>>,
}

impl AuditLog {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let sink = match path {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| Error::QueryLog {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Some(Arc::new(Mutex::new(file)))
            }
            None => None,
        };
        Ok(Self { sink })
    }

    /// A sink that drops everything; used when the query log is disabled.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Record one terminal connection event. Write failures are logged and
    /// swallowed; losing an audit line must not take a session down.
    pub fn record(&self, peer: IpAddr, outcome: Outcome<'_>) {
        debug!("[{}] {}", peer, outcome);

        if let Some(sink) = &self.sink {
            let mut file = sink.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(file, "[{}] {}", peer, outcome) {
                warn!("couldn't write to query log: {}", e);
            }
        }
    }
}

//! Listening socket construction.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::PortRole;
use crate::error::{Error, Result};

/// Backlog deep enough that bursts of clients don't see connection refused.
const LISTEN_BACKLOG: i32 = 256;

/// One bound listening socket plus the role its port plays.
#[derive(Debug)]
pub struct Endpoint {
    pub listener: TcpListener,
    pub addr: SocketAddr,
    pub role: PortRole,
}

/// Create a configured, listening, non-blocking socket.
///
/// SO_REUSEADDR is set so a restarted server can rebind while old
/// connections sit in TIME_WAIT. Failure at any step is startup-fatal;
/// partially constructed sockets are closed by drop.
pub fn create_listener(addr: SocketAddr, role: PortRole) -> Result<Endpoint> {
    let fatal = |source: std::io::Error| Error::Bind { addr, source };

    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(fatal)?;

    socket.set_reuse_address(true).map_err(fatal)?;
    socket.bind(&addr.into()).map_err(fatal)?;
    socket.listen(LISTEN_BACKLOG).map_err(fatal)?;
    socket.set_nonblocking(true).map_err(fatal)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener).map_err(fatal)?;
    let addr = listener.local_addr().map_err(fatal)?;

    info!("listening on {} ({:?})", addr, role);

    Ok(Endpoint {
        listener,
        addr,
        role,
    })
}

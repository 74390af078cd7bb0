//! Server assembly: bind-time setup, accept loops and shutdown.
//!
//! Startup is all-or-nothing: every listening socket, the TLS context, the
//! address filter and the query log must come up before the first accept.
//! After that, nothing a client does can take the process down; per
//! connection failures end that connection only.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tokio_rustls::rustls::server::Acceptor;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, Outcome};
use crate::channel::ByteChannel;
use crate::config::{Config, PortRole, validate_config};
use crate::error::{Error, Result};
use crate::filter::AddressFilter;
use crate::fname::FilenameGenerator;
use crate::listener::{Endpoint, create_listener};
use crate::pool::SlotPool;
use crate::session::{SessionContext, UploadSession};
use crate::tls;

const MSG_NOT_ALLOWED: &[u8] = b"you are not allowed to upload to this server\n";
const MSG_SLOTS_TAKEN: &[u8] = b"all upload slots are taken, try again later\n";
const MSG_INTERNAL_ERROR: &[u8] = b"internal server error, try again later\n";
const MSG_HANDSHAKE_FAILED: &[u8] = b"tls handshake failed\n";

/// How often the drain loop re-checks the slot pool during shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// How long a rejected client gets to half-close before its socket is
/// torn down anyway.
const REJECT_DRAIN: Duration = Duration::from_secs(5);

/// Stage of the shutdown protocol. The first signal moves Run to Drain
/// (stop accepting, wait for uploads); the second moves to Abort (return
/// immediately, possibly leaving partial files — intentional trade-off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownLevel {
    Run,
    Drain,
    Abort,
}

/// Cloneable handle for requesting shutdown from outside the server task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<ShutdownLevel>>,
}

impl ShutdownHandle {
    /// Stop accepting and let in-flight uploads finish.
    pub fn graceful(&self) {
        self.tx.send_modify(|level| {
            if *level == ShutdownLevel::Run {
                *level = ShutdownLevel::Drain;
            }
        });
    }

    /// Terminate without waiting for in-flight uploads.
    pub fn force(&self) {
        self.tx.send_modify(|level| *level = ShutdownLevel::Abort);
    }
}

/// State shared by every accept loop and session task.
struct Shared {
    ctx: Arc<SessionContext>,
    filter: AddressFilter,
    pool: SlotPool,
    names: FilenameGenerator,
    output_dir: PathBuf,
    tls: Option<Arc<RustlsConfig>>,
}

pub struct Server {
    shared: Arc<Shared>,
    endpoints: Vec<Endpoint>,
    shutdown: Arc<watch::Sender<ShutdownLevel>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Validate the configuration and bring up every startup-fatal
    /// resource: filter, query log, TLS context and listening sockets.
    pub async fn bind(config: Config) -> Result<Server> {
        validate_config(&config)?;

        let filter = AddressFilter::build(config.list_file.as_deref(), config.list_mode)?;
        let audit = AuditLog::open(config.query_log.as_deref())?;

        let wants_tls = config.tls_port != 0 || config.timed_tls_port != 0;
        let tls = if wants_tls {
            match (&config.tls.cert_file, &config.tls.key_file) {
                (Some(cert), Some(key)) => Some(tls::load_server_config(cert, key)?),
                _ => {
                    return Err(Error::Config(
                        "TLS port enabled without cert_file/key_file".to_string(),
                    ));
                }
            }
        } else {
            None
        };

        let mut endpoints = Vec::new();
        for ip in &config.bind_ip {
            for (port, role) in config.enabled_ports() {
                endpoints.push(create_listener(SocketAddr::new(*ip, port), role)?);
            }
        }

        let ctx = Arc::new(SessionContext {
            terminator: config.terminator.clone().into_bytes(),
            max_size: config.max_size,
            domain: config.domain.clone(),
            timeout: Duration::from_secs(config.max_timeout),
            timed_timeout: Duration::from_secs(config.timed_max_timeout),
            audit,
        });

        let (shutdown, _) = watch::channel(ShutdownLevel::Run);

        Ok(Server {
            shared: Arc::new(Shared {
                ctx,
                filter,
                pool: SlotPool::new(config.max_connections),
                names: FilenameGenerator::new(),
                output_dir: config.output_dir,
                tls,
            }),
            endpoints,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Actual bound addresses, in the order the endpoints were created.
    pub fn local_addrs(&self) -> Vec<(SocketAddr, PortRole)> {
        self.endpoints.iter().map(|e| (e.addr, e.role)).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Accept until shutdown is requested, then drain.
    pub async fn run(self) -> Result<()> {
        let Server {
            shared,
            endpoints,
            shutdown,
        } = self;

        let mut accept_tasks = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let shared = Arc::clone(&shared);
            let rx = shutdown.subscribe();
            accept_tasks.push(tokio::spawn(accept_loop(shared, endpoint, rx)));
        }

        let mut rx = shutdown.subscribe();
        while *rx.borrow() == ShutdownLevel::Run {
            if rx.changed().await.is_err() {
                break;
            }
        }

        info!("waiting for all connections to finish");
        loop {
            if shared.pool.is_idle() {
                break;
            }
            if *rx.borrow() == ShutdownLevel::Abort {
                warn!(
                    "exiting without waiting for {} connection(s) to finish, \
                     this may leave invalid files in {}",
                    shared.pool.occupied(),
                    shared.output_dir.display()
                );
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(DRAIN_POLL) => {}
                _ = rx.changed() => {}
            }
        }

        for task in &accept_tasks {
            task.abort();
        }

        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    endpoint: Endpoint,
    mut rx: watch::Receiver<ShutdownLevel>,
) {
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() || *rx.borrow() != ShutdownLevel::Run {
                    debug!("accept loop on {} stopping", endpoint.addr);
                    return;
                }
            }
            res = endpoint.listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!("incoming connection from {} on {}", peer, endpoint.addr);
                    let shared = Arc::clone(&shared);
                    let role = endpoint.role;
                    tokio::spawn(handle_client(shared, stream, peer, role));
                }
                // a failed accept never takes the loop down
                Err(e) => warn!("couldn't accept connection on {}: {}", endpoint.addr, e),
            }
        }
    }
}

/// Run one client from accept to the end of its session: admission checks,
/// optional TLS handshake, file creation, then the upload state machine.
async fn handle_client(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr, role: PortRole) {
    let ip = peer.ip();

    if !shared.filter.allowed(ip) {
        shared.ctx.audit.record(ip, Outcome::NotAllowed);
        reject(stream, MSG_NOT_ALLOWED).await;
        return;
    }

    let Some(slot) = shared.pool.acquire() else {
        shared.ctx.audit.record(ip, Outcome::ConnectionLimit);
        reject(stream, MSG_SLOTS_TAKEN).await;
        return;
    };

    let channel = if role.is_tls() {
        match tls_handshake(&shared, stream, ip).await {
            Some(channel) => channel,
            None => return,
        }
    } else {
        ByteChannel::plain(stream)
    };

    let (name, path, file) = match shared.names.create_in(&shared.output_dir) {
        Ok(created) => created,
        Err(e) => {
            warn!("[{}] couldn't open output file: {}", ip, e);
            shared.ctx.audit.record(ip, Outcome::OpenError);
            let mut channel = channel;
            if channel.write_all(MSG_INTERNAL_ERROR).await.is_ok() {
                drain_close(&mut channel).await;
            }
            return;
        }
    };

    let session = UploadSession::new(
        Arc::clone(&shared.ctx),
        channel,
        ip,
        name,
        path,
        tokio::fs::File::from_std(file),
        role.is_timed(),
        slot,
    );
    session.run().await;
}

/// Server-side TLS handshake with the inactivity limit as its deadline.
///
/// If the handshake dies while the client hello is still being read the
/// raw socket can be taken back and a plaintext one-liner sent; past that
/// point the TLS layer owns the socket and the connection just closes.
async fn tls_handshake(shared: &Shared, stream: TcpStream, ip: IpAddr) -> Option<ByteChannel> {
    // bind() only creates TLS endpoints when a context was loaded
    let config = Arc::clone(shared.tls.as_ref()?);
    let limit = shared.ctx.timeout;

    let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
    tokio::pin!(acceptor);

    match tokio::time::timeout(limit, acceptor.as_mut()).await {
        Ok(Ok(start)) => match tokio::time::timeout(limit, start.into_stream(config)).await {
            Ok(Ok(tls_stream)) => Some(ByteChannel::tls(tls_stream)),
            Ok(Err(e)) => {
                warn!("[{}] TLS handshake failed: {}", ip, e);
                shared.ctx.audit.record(ip, Outcome::HandshakeError);
                None
            }
            Err(_) => {
                warn!("[{}] TLS handshake timed out", ip);
                shared.ctx.audit.record(ip, Outcome::HandshakeError);
                None
            }
        },
        Ok(Err(e)) => {
            warn!("[{}] client hello rejected: {}", ip, e);
            shared.ctx.audit.record(ip, Outcome::HandshakeError);
            if let Some(mut raw) = acceptor.take_io() {
                let _ = raw.write_all(MSG_HANDSHAKE_FAILED).await;
            }
            None
        }
        Err(_) => {
            warn!("[{}] client hello timed out", ip);
            shared.ctx.audit.record(ip, Outcome::HandshakeError);
            if let Some(mut raw) = acceptor.take_io() {
                let _ = raw.write_all(MSG_HANDSHAKE_FAILED).await;
            }
            None
        }
    }
}

/// Send a one-line refusal, then half-close and drain. Closing with unread
/// client bytes still buffered turns into an RST that can destroy the
/// refusal before the client reads it.
async fn reject(stream: TcpStream, msg: &[u8]) {
    let mut channel = ByteChannel::plain(stream);
    if let Err(e) = channel.write_all(msg).await {
        debug!("couldn't send rejection reply: {}", e);
        return;
    }
    drain_close(&mut channel).await;
}

/// Half-close, then discard whatever the peer still sends until its FIN,
/// an error, or the drain limit.
async fn drain_close(channel: &mut ByteChannel) {
    if channel.shutdown().await.is_err() {
        return;
    }
    let mut scratch = [0u8; 4096];
    let drain_until = tokio::time::Instant::now() + REJECT_DRAIN;
    loop {
        match tokio::time::timeout_at(drain_until, channel.read(&mut scratch)).await {
            Ok(Ok(n)) if n > 0 => continue,
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListMode;

    fn test_config(dir: &std::path::Path, port: u16) -> Config {
        Config {
            bind_ip: vec![IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)],
            listen_port: port,
            output_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn free_port() -> u16 {
        free_ports(1)[0]
    }

    /// Reserve distinct ports by holding all probe sockets open at once.
    fn free_ports(n: usize) -> Vec<u16> {
        let listeners: Vec<_> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    #[tokio::test]
    async fn bind_brings_up_all_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let ports = free_ports(2);
        let mut config = test_config(dir.path(), ports[0]);
        config.timed_port = ports[1];

        let server = Server::bind(config).await.unwrap();
        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().any(|(_, role)| *role == PortRole::Plain));
        assert!(addrs.iter().any(|(_, role)| *role == PortRole::TimedPlain));
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 0);
        config.listen_port = 0; // nothing enabled
        assert!(Server::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn bind_fails_when_filtering_has_no_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), free_port());
        config.list_mode = ListMode::Whitelist;
        let err = Server::bind(config).await.unwrap_err();
        assert!(matches!(err, Error::ListMissing));
    }

    #[tokio::test]
    async fn graceful_then_force_shutdown_terminates_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), free_port());

        let server = Server::bind(config).await.unwrap();
        let handle = server.shutdown_handle();
        let run = tokio::spawn(server.run());

        handle.graceful();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run() should return after graceful shutdown with no sessions")
            .unwrap()
            .unwrap();
    }
}

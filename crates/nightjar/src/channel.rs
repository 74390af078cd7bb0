//! Plain/TLS byte channel.
//!
//! Client connections are either raw TCP or TLS over TCP. The variant is
//! decided once, at accept time; everything downstream works against this
//! enum instead of re-checking a flag at every call site.

use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

pub enum ByteChannel {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ByteChannel {
    pub fn plain(stream: TcpStream) -> Self {
        ByteChannel::Plain(stream)
    }

    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        ByteChannel::Tls(Box::new(stream))
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ByteChannel::Plain(s) => s.read(buf).await,
            ByteChannel::Tls(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            ByteChannel::Plain(s) => s.write_all(buf).await,
            ByteChannel::Tls(s) => s.write_all(buf).await,
        }
    }

    /// Half-close: flush and shut down the write side, leaving the read
    /// side open so the peer's remaining bytes can be drained. For TLS this
    /// also sends close_notify.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            ByteChannel::Plain(s) => s.shutdown().await,
            ByteChannel::Tls(s) => s.shutdown().await,
        }
    }
}

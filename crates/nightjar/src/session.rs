//! Per-connection upload state machine.
//!
//! A session owns one client connection and one freshly created file, from
//! accept to finalize or abort. Data is appended to the file as it arrives;
//! a rolling tail of the last few bytes is compared against the terminator
//! after every chunk. Three things end an upload successfully: the
//! terminator, the peer closing its write side, or (on timed ports only) a
//! long enough gap of silence. Everything else aborts, and an aborted
//! upload leaves nothing on disk.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, Outcome};
use crate::channel::ByteChannel;
use crate::deadline::InactivityDeadline;
use crate::pool::SlotGuard;

/// Read chunk size; also the largest unit the oversize check is applied to.
const READ_BUF_SIZE: usize = 8192;

/// How long a finished session waits for the peer's FIN before giving up
/// on the half-close handshake.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum gap between progress lines sent to the client.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

const MSG_INTERNAL_ERROR: &[u8] = b"internal server error, try again later\n";

/// Configuration and collaborators shared by every session.
pub struct SessionContext {
    pub terminator: Vec<u8>,
    pub max_size: u64,
    pub domain: String,
    pub timeout: Duration,
    pub timed_timeout: Duration,
    pub audit: AuditLog,
}

enum Event {
    Read(std::io::Result<usize>),
    DeadlinePassed,
}

enum Ingest {
    /// Await more data.
    Continue,
    /// Terminator seen; finalize and strip it.
    Complete,
    /// Session is over; reply, audit record and file removal are done,
    /// only the linger remains.
    Abort,
}

pub struct UploadSession {
    ctx: Arc<SessionContext>,
    channel: ByteChannel,
    peer: IpAddr,
    name: String,
    path: PathBuf,
    file: File,
    written: u64,
    tail: Vec<u8>,
    deadline: InactivityDeadline,
    timed: bool,
    last_progress: std::time::Instant,
    _slot: SlotGuard,
}

impl UploadSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<SessionContext>,
        channel: ByteChannel,
        peer: IpAddr,
        name: String,
        path: PathBuf,
        file: File,
        timed: bool,
        slot: SlotGuard,
    ) -> Self {
        let limit = if timed { ctx.timed_timeout } else { ctx.timeout };
        let tail_capacity = ctx.terminator.len();
        Self {
            ctx,
            channel,
            peer,
            name,
            path,
            file,
            written: 0,
            tail: Vec::with_capacity(tail_capacity),
            deadline: InactivityDeadline::new(limit),
            timed,
            last_progress: std::time::Instant::now(),
            _slot: slot,
        }
    }

    /// Drive the session to completion. Never returns an error; every
    /// failure is terminal to this connection only and has already been
    /// replied to and audit-logged by the time this returns.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let wake_at = self.deadline.instant();
            let event = tokio::select! {
                res = self.channel.read(&mut buf) => Event::Read(res),
                _ = tokio::time::sleep_until(wake_at) => Event::DeadlinePassed,
            };

            match event {
                // peer closed its write side: implicit end of upload
                Event::Read(Ok(0)) => return self.finalize(false).await,
                Event::Read(Ok(n)) => match self.ingest(&buf[..n]).await {
                    Ingest::Continue => {}
                    Ingest::Complete => return self.finalize(true).await,
                    Ingest::Abort => return self.linger().await,
                },
                Event::Read(Err(e)) => {
                    warn!("[{}] couldn't read from client: {}", self.peer, e);
                    self.reply(MSG_INTERNAL_ERROR).await;
                    return self.abort(Outcome::ReadError).await;
                }
                Event::DeadlinePassed if self.timed => {
                    // on timed ports silence is the end-of-upload signal
                    debug!("[{}] inactivity gap, treating upload as complete", self.peer);
                    return self.finalize(false).await;
                }
                Event::DeadlinePassed => {
                    info!(
                        "[{}] client inactive for {} seconds",
                        self.peer,
                        self.ctx.timeout.as_secs()
                    );
                    let msg = format!(
                        "disconnected due to inactivity for {} seconds, did you \
                         forget to append termination string - {:?}?\n",
                        self.ctx.timeout.as_secs(),
                        String::from_utf8_lossy(&self.ctx.terminator),
                    );
                    self.reply(msg.as_bytes()).await;
                    return self.abort(Outcome::Inactivity).await;
                }
            }
        }
    }

    /// Handle one chunk of received data.
    async fn ingest(&mut self, chunk: &[u8]) -> Ingest {
        let term_len = self.ctx.terminator.len() as u64;

        // the terminator is stripped later, so it may run past max_size
        if self.written + chunk.len() as u64 > self.ctx.max_size + term_len {
            let msg = format!(
                "file too big, max length is {} bytes\n",
                self.ctx.max_size
            );
            self.reply(msg.as_bytes()).await;
            self.abort_in_place(Outcome::TooBig).await;
            return Ingest::Abort;
        }

        if let Err(e) = self.file.write_all(chunk).await {
            warn!("[{}] couldn't write to file: {}", self.peer, e);
            self.reply(MSG_INTERNAL_ERROR).await;
            self.abort_in_place(Outcome::WriteError).await;
            return Ingest::Abort;
        }

        self.written += chunk.len() as u64;
        update_tail(&mut self.tail, chunk, self.ctx.terminator.len());
        self.deadline.refresh();

        if self.written < term_len {
            // not enough bytes yet to hold a terminator
            return Ingest::Continue;
        }

        if self.tail == self.ctx.terminator {
            return Ingest::Complete;
        }

        if self.last_progress.elapsed() >= PROGRESS_INTERVAL {
            self.last_progress = std::time::Instant::now();
            let msg = format!("uploaded {:10} bytes\n", self.written);
            self.reply(msg.as_bytes()).await;
        }

        Ingest::Continue
    }

    /// Wrap up a finished upload. `consumed_terminator` says whether the
    /// terminator bytes were actually written to the file and must be cut
    /// off; the EOF and timed-silence paths pass false and keep the raw
    /// payload.
    async fn finalize(mut self, consumed_terminator: bool) {
        if let Err(e) = self.file.flush().await {
            warn!("[{}] couldn't flush file: {}", self.peer, e);
            self.reply(MSG_INTERNAL_ERROR).await;
            return self.abort(Outcome::WriteError).await;
        }

        let term_len = self.ctx.terminator.len() as u64;
        let final_len = if consumed_terminator {
            self.written - term_len
        } else {
            self.written
        };

        if consumed_terminator {
            if let Err(e) = self.file.set_len(final_len).await {
                warn!("[{}] couldn't truncate terminator from file: {}", self.peer, e);
                self.reply(MSG_INTERNAL_ERROR).await;
                return self.abort(Outcome::WriteError).await;
            }
        }

        if final_len == 0 {
            self.reply(b"no data has been sent\n").await;
            return self.abort(Outcome::NoData).await;
        }

        self.ctx.audit.record(self.peer, Outcome::Stored(&self.name));
        let msg = format!(
            "upload complete, link to file {}/{}\n",
            self.ctx.domain, self.name
        );
        self.reply(msg.as_bytes()).await;
        self.linger().await;
    }

    /// Terminal failure path: the reply has been sent; log the outcome,
    /// remove the partial file, and run the half-close handshake.
    async fn abort(mut self, outcome: Outcome<'_>) {
        self.abort_in_place(outcome).await;
        self.linger().await;
    }

    async fn abort_in_place(&mut self, outcome: Outcome<'_>) {
        self.ctx.audit.record(self.peer, outcome);

        // unlink before the peer observes the close, so a client that saw
        // our reply never finds a leftover partial file
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(
                "[{}] couldn't remove unfinished upload {}: {}",
                self.peer,
                self.path.display(),
                e
            );
        }
    }

    /// Half-close, then drain whatever the peer still sends until its FIN
    /// arrives, so the final reply is not torn down by an RST.
    async fn linger(&mut self) {
        if let Err(e) = self.channel.shutdown().await {
            debug!("[{}] shutdown failed during linger: {}", self.peer, e);
            return;
        }

        let mut scratch = [0u8; 4096];
        let drain_until = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(drain_until, self.channel.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => continue,
                // EOF, error or drain timeout all end the linger
                _ => break,
            }
        }
    }

    /// Best-effort single-line reply; a client that is gone already is not
    /// an error worth escalating.
    async fn reply(&mut self, msg: &[u8]) {
        if let Err(e) = self.channel.write_all(msg).await {
            warn!("[{}] error writing reply to the client: {}", self.peer, e);
        }
    }
}

/// Keep `tail` holding the last `term_len` bytes written so far.
fn update_tail(tail: &mut Vec<u8>, chunk: &[u8], term_len: usize) {
    if chunk.len() >= term_len {
        tail.clear();
        tail.extend_from_slice(&chunk[chunk.len() - term_len..]);
    } else {
        tail.extend_from_slice(chunk);
        if tail.len() > term_len {
            tail.drain(..tail.len() - term_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_tracks_last_bytes_of_large_chunks() {
        let mut tail = Vec::new();
        update_tail(&mut tail, b"hello world termsend\n", 9);
        assert_eq!(tail, b"termsend\n");
    }

    #[test]
    fn tail_accumulates_small_chunks() {
        let mut tail = Vec::new();
        update_tail(&mut tail, b"ter", 9);
        assert_eq!(tail, b"ter");
        update_tail(&mut tail, b"mse", 9);
        assert_eq!(tail, b"termse");
        update_tail(&mut tail, b"nd\n", 9);
        assert_eq!(tail, b"termsend\n");
    }

    #[test]
    fn tail_slides_across_chunk_boundaries() {
        let mut tail = Vec::new();
        update_tail(&mut tail, b"some paylo", 9);
        update_tail(&mut tail, b"ad term", 9);
        update_tail(&mut tail, b"send\n", 9);
        assert_eq!(tail, b"termsend\n");
    }

    #[test]
    fn tail_never_exceeds_terminator_length() {
        let mut tail = Vec::new();
        for _ in 0..100 {
            update_tail(&mut tail, b"abc", 9);
            assert!(tail.len() <= 9);
        }
    }

    #[test]
    fn tail_with_single_byte_terminator() {
        let mut tail = Vec::new();
        update_tail(&mut tail, b"xyz", 1);
        assert_eq!(tail, b"z");
        update_tail(&mut tail, b"\n", 1);
        assert_eq!(tail, b"\n");
    }
}

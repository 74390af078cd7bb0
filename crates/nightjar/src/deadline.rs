//! Per-session inactivity deadline.
//!
//! Each live session keeps one armed deadline; the runtime's timer wheel
//! keeps a single OS timer armed at the nearest sleep across all sessions,
//! so many idle uploads cost one timer, not one timer each. An instant in
//! the past fires immediately, re-arming keeps the newly requested instant,
//! and dropping the deadline disarms it.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct InactivityDeadline {
    limit: Duration,
    at: Instant,
}

impl InactivityDeadline {
    /// Arm a deadline `limit` from now.
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            at: Instant::now() + limit,
        }
    }

    /// Push the deadline out to `limit` from now. Called after every
    /// successful read.
    pub fn refresh(&mut self) {
        self.at = Instant::now() + self.limit;
    }

    /// Instant the deadline fires at; feed this to `sleep_until`.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Resolves when the deadline passes.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.at).await;
    }
}

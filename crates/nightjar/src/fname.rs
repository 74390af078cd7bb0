//! Random filename generation for stored uploads.
//!
//! Names are short lowercase-alphanumeric strings; uniqueness is advisory
//! and enforced by exclusive create, not by the generator. When the output
//! directory fills up with names of the current length, collisions repeat
//! and the generator permanently moves to longer names.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length new names start at.
pub const DEFAULT_NAME_LEN: usize = 8;

/// Hard cap on generated name length.
const MAX_NAME_LEN: usize = 31;

/// Consecutive collisions tolerated before growing the name length.
const COLLISIONS_BEFORE_GROWTH: u32 = 3;

/// How many times the at-cap condition is logged before going quiet.
const CAP_WARNING_LIMIT: u32 = 8;

struct GenState {
    rng: SmallRng,
    len: usize,
    collisions: u32,
    cap_warnings: u32,
}

/// Generates names and opens the backing file with exclusive create.
///
/// A single mutex serializes generate-and-create so concurrent sessions
/// cannot race the adaptive-length state or each other's open. Opening is
/// fast, so the critical section is short.
pub struct FilenameGenerator {
    state: Mutex<GenState>,
}

impl FilenameGenerator {
    pub fn new() -> Self {
        Self::with_start_len(DEFAULT_NAME_LEN)
    }

    pub fn with_start_len(len: usize) -> Self {
        Self {
            state: Mutex::new(GenState {
                rng: SmallRng::from_entropy(),
                len: len.min(MAX_NAME_LEN),
                collisions: 0,
                cap_warnings: 0,
            }),
        }
    }

    /// Create a fresh file in `dir`, returning its name, full path and
    /// write handle.
    ///
    /// Retries on name collision. After three consecutive collisions at the
    /// current length the length grows by one for the rest of the process
    /// lifetime; a restart begins again at the short default. Errors other
    /// than "already exists" are returned to the caller.
    pub fn create_in(&self, dir: &Path) -> std::io::Result<(String, PathBuf, std::fs::File)> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            let len = state.len;
            let name = generate(&mut state.rng, len);
            let path = dir.join(&name);

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    state.collisions = 0;
                    return Ok((name, path, file));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    state.collisions += 1;
                    if state.collisions == COLLISIONS_BEFORE_GROWTH {
                        state.collisions = 0;
                        if state.len < MAX_NAME_LEN {
                            state.len += 1;
                            info!("name collisions piling up, growing name length to {}",
                                state.len);
                        } else if state.cap_warnings < CAP_WARNING_LIMIT {
                            state.cap_warnings += 1;
                            warn!("name length is at its cap of {} and still colliding",
                                MAX_NAME_LEN);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for FilenameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn generate(rng: &mut SmallRng, len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

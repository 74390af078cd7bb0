//! Upload slot pool.
//!
//! A fixed number of slots bounds how many clients may upload at once.
//! A slot is claimed at accept time and handed to the session task inside
//! an RAII guard, so every exit path (finalize, abort, panic) frees it
//! exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug)]
struct Slots {
    /// true = occupied. Index is the stable slot id.
    occupied: Vec<bool>,
}

/// Fixed-capacity admission pool.
#[derive(Debug, Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    slots: Mutex<Slots>,
    live: AtomicUsize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(Slots {
                    occupied: vec![false; capacity],
                }),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Claim a free slot, or None when every slot is taken.
    pub fn acquire(&self) -> Option<SlotGuard> {
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let id = slots.occupied.iter().position(|taken| !taken)?;
        slots.occupied[id] = true;
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        debug!("slot {} acquired ({}/{})", id, self.occupied(), slots.occupied.len());
        Some(SlotGuard {
            pool: Arc::clone(&self.inner),
            id,
        })
    }

    /// Number of occupied slots right now.
    pub fn occupied(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.occupied() == 0
    }
}

/// Claim on one upload slot; freed on drop.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<PoolInner>,
    id: usize,
}

impl SlotGuard {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.pool.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.occupied[self.id] = false;
        self.pool.live.fetch_sub(1, Ordering::SeqCst);
        debug!("slot {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_enforces_capacity() {
        let pool = SlotPool::new(2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none(), "third acquire must fail");
        assert_eq!(pool.occupied(), 2);

        drop(a);
        assert_eq!(pool.occupied(), 1);
        let c = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        drop(b);
        drop(c);
        assert!(pool.is_idle());
    }

    #[test]
    fn released_slot_ids_are_reused() {
        let pool = SlotPool::new(1);
        let first = pool.acquire().unwrap();
        let id = first.id();
        drop(first);
        let second = pool.acquire().unwrap();
        assert_eq!(second.id(), id);
    }

    #[test]
    fn zero_capacity_pool_admits_nothing() {
        let pool = SlotPool::new(0);
        assert!(pool.acquire().is_none());
        assert!(pool.is_idle());
    }
}

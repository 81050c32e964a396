//! Dense per-thread ids used to index per-thread slot tables.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Returned when every id of a registry is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryFull {
    pub capacity: usize,
}

impl fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all {} thread slots are registered; drop a handle or raise the thread capacity",
            self.capacity
        )
    }
}

impl Error for RegistryFull {}

/// Hands out ids from `0..capacity`, always the lowest one not currently held.
#[derive(Debug)]
pub struct ThreadRegistry {
    taken: Mutex<Vec<bool>>,
    active: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            taken: Mutex::new(vec![false; capacity]),
            active: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.taken.lock().len()
    }

    /// Number of ids currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn register(&self) -> Result<ThreadId<'_>, RegistryFull> {
        let mut taken = self.taken.lock();
        let capacity = taken.len();
        match taken.iter().position(|t| !t) {
            Some(id) => {
                taken[id] = true;
                self.active.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id, "registered thread");
                Ok(ThreadId { registry: self, id })
            }
            None => {
                tracing::warn!(capacity, "thread registry is full");
                Err(RegistryFull { capacity })
            }
        }
    }

    fn release(&self, id: usize) {
        let mut taken = self.taken.lock();
        debug_assert!(taken[id]);
        taken[id] = false;
        self.active.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(id, "released thread");
    }
}

/// A registered id. The id goes back to the registry on drop.
#[derive(Debug)]
pub struct ThreadId<'r> {
    registry: &'r ThreadRegistry,
    id: usize,
}

impl ThreadId<'_> {
    #[inline]
    pub fn get(&self) -> usize {
        self.id
    }
}

impl Drop for ThreadId<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

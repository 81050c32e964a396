use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::retire::Retired;
use super::thread::Thread;
use crate::registry::{RegistryFull, ThreadRegistry};

/// Retire lists are scanned once they hold more than this many times the total slot count.
pub const RETIRE_FACTOR: usize = 2;

/// The per-thread publication slots of one thread.
#[derive(Debug)]
pub(crate) struct ThreadSlots {
    pub(crate) hazptrs: Box<[AtomicPtr<u8>]>,
    /// Bit `i` is set while slot `i` is claimed by a live `HazardPointer`.
    pub(crate) claimed: AtomicUsize,
}

/// A fixed table of hazard pointers shared by at most `threads` registered threads.
#[derive(Debug)]
pub struct Domain {
    pub(crate) slots: Box<[CachePadded<ThreadSlots>]>,
    slots_per_thread: usize,
    registry: ThreadRegistry,
    /// Leftovers of threads that unregistered while some of their garbage was still protected.
    orphans: Mutex<Vec<Retired>>,
    garbage: AtomicUsize,
}

impl Domain {
    pub fn new(threads: usize, slots_per_thread: usize) -> Self {
        assert!(
            slots_per_thread <= usize::BITS as usize,
            "at most {} hazard slots per thread",
            usize::BITS
        );
        let slots = (0..threads)
            .map(|_| {
                CachePadded::new(ThreadSlots {
                    hazptrs: (0..slots_per_thread)
                        .map(|_| AtomicPtr::new(ptr::null_mut()))
                        .collect(),
                    claimed: AtomicUsize::new(0),
                })
            })
            .collect();
        Self {
            slots,
            slots_per_thread,
            registry: ThreadRegistry::new(threads),
            orphans: Mutex::new(Vec::new()),
            garbage: AtomicUsize::new(0),
        }
    }

    /// Registers the calling thread, giving it a dense id and its own row of slots.
    pub fn register(&self) -> Result<Thread<'_>, RegistryFull> {
        let id = self.registry.register()?;
        debug_assert_eq!(
            self.slots[id.get()].claimed.load(Ordering::Relaxed),
            0,
            "slots of a released thread are still claimed"
        );
        Ok(Thread::new(self, id))
    }

    pub fn threads(&self) -> usize {
        self.slots.len()
    }

    pub fn slots_per_thread(&self) -> usize {
        self.slots_per_thread
    }

    pub fn total_slots(&self) -> usize {
        self.slots.len() * self.slots_per_thread
    }

    /// Number of threads currently registered.
    pub fn active_threads(&self) -> usize {
        self.registry.active()
    }

    /// Number of retired objects that have not been freed yet.
    pub fn garbage(&self) -> usize {
        self.garbage.load(Ordering::Relaxed)
    }

    pub(crate) fn add_garbage(&self, count: usize) {
        self.garbage.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn sub_garbage(&self, count: usize) {
        self.garbage.fetch_sub(count, Ordering::Relaxed);
    }

    /// Sorted snapshot of every published non-null pointer.
    pub(crate) fn collect_guarded_ptrs(&self) -> Vec<*mut u8> {
        let mut guarded: Vec<*mut u8> = self
            .slots
            .iter()
            .flat_map(|thread| thread.hazptrs.iter())
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|ptr| !ptr.is_null())
            .collect();
        guarded.sort_unstable();
        guarded
    }

    pub(crate) fn push_orphans(&self, retireds: &mut Vec<Retired>) {
        if !retireds.is_empty() {
            self.orphans.lock().append(retireds);
        }
    }

    pub(crate) fn adopt_orphans(&self, into: &mut Vec<Retired>) {
        if let Some(mut orphans) = self.orphans.try_lock() {
            into.append(&mut orphans);
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // Every `Thread` borrows the domain, so none is alive and nothing is protected.
        let orphans = core::mem::take(self.orphans.get_mut());
        self.sub_garbage(orphans.len());
        for retired in orphans {
            unsafe { retired.execute() };
        }
    }
}

use core::cell::RefCell;
use core::sync::atomic::{fence, Ordering};

use super::domain::{Domain, RETIRE_FACTOR};
use super::hazard::HazardPointer;
use super::retire::Retired;
use crate::registry::ThreadId;

/// A registered participant of a [`Domain`]: owns one row of hazard slots and a private retire
/// list.
pub struct Thread<'domain> {
    pub(crate) domain: &'domain Domain,
    id: ThreadId<'domain>,
    retired: RefCell<Vec<Retired>>,
}

impl<'domain> Thread<'domain> {
    pub(crate) fn new(domain: &'domain Domain, id: ThreadId<'domain>) -> Self {
        Self {
            domain,
            id,
            retired: RefCell::new(Vec::new()),
        }
    }

    /// The dense id this thread was registered under.
    pub fn id(&self) -> usize {
        self.id.get()
    }

    /// Claims a free publication slot of this thread.
    ///
    /// The returned hazard pointer must be dropped before this `Thread`, otherwise the slot would
    /// still be claimed when the id is handed to the next thread.
    ///
    /// # Panics
    /// Panics if all of this thread's slots are claimed.
    pub fn hazard_pointer(&self) -> HazardPointer<'domain> {
        HazardPointer::new(self.domain, self.id.get())
    }

    /// Number of retired objects this thread has not freed yet.
    pub fn retired_len(&self) -> usize {
        self.retired.borrow().len()
    }

    /// Defers freeing `ptr` until no hazard pointer publishes it.
    ///
    /// # Safety
    /// * `ptr` came from `Box::<T>::into_raw` and is retired exactly once.
    /// * It is no longer reachable from shared memory, so no thread can newly protect it.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let len = {
            let mut retired = self.retired.borrow_mut();
            retired.push(Retired::new(ptr));
            retired.len()
        };
        self.domain.add_garbage(1);
        if len > RETIRE_FACTOR * self.domain.total_slots() {
            self.scan();
        }
    }

    /// Frees every retired object that is not published in any slot of the domain.
    pub fn scan(&self) {
        let mut retired = self.retired.borrow_mut();
        self.domain.adopt_orphans(&mut retired);

        // Pairs with the fence in `HazardPointer::validate`. Either the protector sees the unlink,
        // or we see its hazard pointer.
        fence(Ordering::SeqCst);
        let guarded = self.domain.collect_guarded_ptrs();

        let before = retired.len();
        retired.retain(|r| {
            if guarded.binary_search(&r.ptr).is_ok() {
                true
            } else {
                unsafe { r.execute() };
                false
            }
        });
        let freed = before - retired.len();
        self.domain.sub_garbage(freed);
        tracing::trace!(
            thread = self.id.get(),
            freed,
            kept = retired.len(),
            guarded = guarded.len(),
            "hazard pointer scan"
        );
    }
}

impl Drop for Thread<'_> {
    fn drop(&mut self) {
        self.scan();
        self.domain.push_orphans(self.retired.get_mut());
    }
}

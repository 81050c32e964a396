use core::mem;
use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, Ordering};

use super::domain::Domain;

/// One claimed publication slot. Whatever it publishes is not freed by any scan of the domain.
#[derive(Debug)]
pub struct HazardPointer<'domain> {
    domain: &'domain Domain,
    tid: usize,
    idx: usize,
}

impl<'domain> HazardPointer<'domain> {
    pub(crate) fn new(domain: &'domain Domain, tid: usize) -> Self {
        let claimed = &domain.slots[tid].claimed;
        let mask = claimed.load(Ordering::Relaxed);
        let idx = (!mask).trailing_zeros() as usize;
        assert!(
            idx < domain.slots_per_thread(),
            "thread {} has no free hazard slot (capacity {})",
            tid,
            domain.slots_per_thread()
        );
        // Only the owner claims, so `idx` stays free. Releases may come from any thread.
        claimed.fetch_or(1 << idx, Ordering::Relaxed);
        Self { domain, tid, idx }
    }

    #[inline]
    fn slot(&self) -> &AtomicPtr<u8> {
        &self.domain.slots[self.tid].hazptrs[self.idx]
    }

    /// Publishes `ptr`.
    ///
    /// This alone does not make `ptr` safe to dereference: it may have been retired and freed
    /// between being read and being published. Prefer [`HazardPointer::protect`] or validate the
    /// source afterwards.
    #[inline]
    pub fn protect_raw<T>(&mut self, ptr: *mut T) {
        self.slot().store(ptr as *mut u8, Ordering::Release);
    }

    /// Withdraws the current publication, if any.
    #[inline]
    pub fn reset_protection(&mut self) {
        self.slot().store(ptr::null_mut(), Ordering::Release);
    }

    /// The currently published pointer.
    #[inline]
    pub fn published(&self) -> *mut u8 {
        self.slot().load(Ordering::Relaxed)
    }

    /// Checks that `src` still holds `pointer`. If not, returns the current value.
    ///
    /// If "`src` still holds `pointer`" implies that `pointer` is not retired, `Ok(())` means any
    /// publication of `pointer` made before this call is effective.
    #[inline]
    pub fn validate<T>(pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        fence(Ordering::SeqCst);
        let new = src.load(Ordering::Acquire);
        if pointer == new {
            Ok(())
        } else {
            Err(new)
        }
    }

    /// Publishes `pointer` obtained from `src`, then validates it.
    #[inline]
    pub fn try_protect<T>(&mut self, pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        self.protect_raw(pointer);
        Self::validate(pointer, src)
    }

    /// Reads `src` and publishes the value, retrying until the publication is validated.
    pub fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        let mut pointer = src.load(Ordering::Relaxed);
        while let Err(new) = self.try_protect(pointer, src) {
            pointer = new;
        }
        pointer
    }

    /// Exchanges the slots of two hazard pointers of the same thread, so each keeps protecting
    /// what the other did.
    #[inline]
    pub fn swap(x: &mut HazardPointer<'domain>, y: &mut HazardPointer<'domain>) {
        debug_assert_eq!(x.tid, y.tid);
        mem::swap(&mut x.idx, &mut y.idx);
    }
}

impl Drop for HazardPointer<'_> {
    fn drop(&mut self) {
        self.reset_protection();
        self.domain.slots[self.tid]
            .claimed
            .fetch_and(!(1 << self.idx), Ordering::Relaxed);
    }
}

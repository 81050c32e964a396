//! Atomic state reference: a pointer and a two-bit [`State`] updated as one word.
//!
//! The state lives in the low bits that the pointee's alignment keeps zero, so any `T` aligned to
//! at least four bytes can be referenced. Nothing here depends on the pointer width.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const STATE_MASK: usize = 0b11;

/// Progress of the structural change announced on an internal node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Clean = 0,
    InsertFlag = 1,
    DeleteFlag = 2,
    /// The node is about to be spliced out of the tree.
    Marked = 3,
}

impl State {
    #[inline]
    fn from_bits(bits: usize) -> Self {
        match bits & STATE_MASK {
            0 => State::Clean,
            1 => State::InsertFlag,
            2 => State::DeleteFlag,
            _ => State::Marked,
        }
    }
}

/// A snapshot of an [`AtomicStateRef`].
pub struct StateRef<T> {
    raw: *mut T,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for StateRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateRef<T> {}

impl<T> PartialEq for StateRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for StateRef<T> {}

impl<T> fmt::Debug for StateRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRef")
            .field("ptr", &self.ptr())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> StateRef<T> {
    const ALIGNED: () = assert!(
        mem::align_of::<T>() > STATE_MASK,
        "pointee is not aligned enough to carry a state tag"
    );

    #[inline]
    pub fn new(ptr: *mut T, state: State) -> Self {
        let () = Self::ALIGNED;
        debug_assert_eq!(ptr as usize & STATE_MASK, 0);
        Self {
            raw: (ptr as usize | state as usize) as *mut T,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn null() -> Self {
        Self::new(ptr::null_mut(), State::Clean)
    }

    #[inline]
    fn from_raw(raw: *mut T) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn ptr(&self) -> *mut T {
        (self.raw as usize & !STATE_MASK) as *mut T
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_bits(self.raw as usize)
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.state() == State::Clean
    }

    /// The same reference carrying another state.
    #[inline]
    pub fn with_state(&self, state: State) -> Self {
        Self::new(self.ptr(), state)
    }
}

/// An atomically updatable `(pointer, state)` pair.
pub struct AtomicStateRef<T> {
    link: AtomicPtr<T>,
}

unsafe impl<T> Send for AtomicStateRef<T> {}
unsafe impl<T> Sync for AtomicStateRef<T> {}

impl<T> Default for AtomicStateRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for AtomicStateRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl<T> AtomicStateRef<T> {
    pub fn new(init: StateRef<T>) -> Self {
        Self {
            link: AtomicPtr::new(init.raw),
        }
    }

    pub fn null() -> Self {
        Self::new(StateRef::null())
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> StateRef<T> {
        StateRef::from_raw(self.link.load(order))
    }

    #[inline]
    pub fn store(&self, new: StateRef<T>, order: Ordering) {
        self.link.store(new.raw, order)
    }

    /// Replaces `current` with `new` iff both the pointer and the state still match. On failure
    /// the value found in place of `current` is returned.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: StateRef<T>,
        new: StateRef<T>,
    ) -> Result<StateRef<T>, StateRef<T>> {
        self.link
            .compare_exchange(current.raw, new.raw, Ordering::SeqCst, Ordering::SeqCst)
            .map(StateRef::from_raw)
            .map_err(StateRef::from_raw)
    }
}

//! Mapping from stored values to the ordered integer keys the trees route on.

use std::cmp::Ordering;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

/// Maps a value to the fixed-width key it is ordered by.
///
/// The trees never look at the value itself, so two distinct values that map to the same key are
/// treated as one element. Keeping the function injective over the values used in a run is the
/// caller's job.
pub trait KeyFn<T: ?Sized>: Send + Sync {
    fn key(&self, item: &T) -> u64;
}

impl<T: ?Sized, F> KeyFn<T> for F
where
    F: Fn(&T) -> u64 + Send + Sync,
{
    #[inline]
    fn key(&self, item: &T) -> u64 {
        self(item)
    }
}

/// Uses the value itself as the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityKey;

impl<T> KeyFn<T> for IdentityKey
where
    T: Copy + Into<u64>,
{
    #[inline]
    fn key(&self, item: &T) -> u64 {
        (*item).into()
    }
}

/// Uses the 64-bit hash of the value as the key.
#[derive(Debug, Default, Clone)]
pub struct HashKey<S = RandomState> {
    build_hasher: S,
}

impl HashKey {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> HashKey<S> {
    pub fn with_hasher(build_hasher: S) -> Self {
        Self { build_hasher }
    }
}

impl<T, S> KeyFn<T> for HashKey<S>
where
    T: Hash + ?Sized,
    S: BuildHasher + Send + Sync,
{
    #[inline]
    fn key(&self, item: &T) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        item.hash(&mut hasher);
        hasher.finish()
    }
}

/// A routing key. `Inf1` and `Inf2` only ever appear on the two sentinel leaves and the root, so
/// every `u64` stays available for real values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Key {
    Fin(u64),
    Inf1,
    Inf2,
}

impl Key {
    #[inline]
    fn rank(&self) -> u8 {
        match self {
            Key::Fin(_) => 0,
            Key::Inf1 => 1,
            Key::Inf2 => 2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Fin(k1), Key::Fin(k2)) => k1.cmp(k2),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq<u64> for Key {
    fn eq(&self, rhs: &u64) -> bool {
        matches!(self, Key::Fin(k) if k == rhs)
    }
}

impl PartialOrd<u64> for Key {
    fn partial_cmp(&self, rhs: &u64) -> Option<Ordering> {
        match self {
            Key::Fin(k) => k.partial_cmp(rhs),
            _ => Some(Ordering::Greater),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Fin(k) => write!(f, "{}", k),
            Key::Inf1 => write!(f, "inf1"),
            Key::Inf2 => write!(f, "inf2"),
        }
    }
}

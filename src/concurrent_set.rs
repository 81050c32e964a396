/// The contract both trees satisfy.
///
/// A `Handle` carries whatever per-thread context an implementation needs (hazard slots for the
/// lock-free tree, nothing for the locking one). Each worker thread creates its own.
pub trait ConcurrentSet<T> {
    type Handle<'s>
    where
        Self: 's;

    fn handle(&self) -> Self::Handle<'_>;

    /// Returns `false` iff an element with the same key is already present.
    fn insert<'s>(&'s self, handle: &mut Self::Handle<'s>, item: T) -> bool;

    /// Returns `false` iff no element with the same key is present.
    fn remove<'s>(&'s self, handle: &mut Self::Handle<'s>, item: &T) -> bool;

    fn find<'s>(&'s self, handle: &mut Self::Handle<'s>, item: &T) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub mod tests {
    extern crate rand;
    use super::ConcurrentSet;
    use crossbeam_utils::thread;
    use rand::prelude::*;

    const THREADS: u64 = 30;
    const ELEMENTS_PER_THREADS: u64 = 1000;

    pub fn smoke<S: ConcurrentSet<u64> + Send + Sync>(set: &S) {
        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut handle = set.handle();
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert!(set.insert(&mut handle, i));
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(set.len(), (THREADS * ELEMENTS_PER_THREADS) as usize);

        thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    let mut handle = set.handle();
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert!(set.remove(&mut handle, &i));
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut handle = set.handle();
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert_eq!(set.find(&mut handle, &i), t >= THREADS / 2);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(
            set.len(),
            ((THREADS - THREADS / 2) * ELEMENTS_PER_THREADS) as usize
        );
    }

    /// Threads race on the same small key range. Afterwards the membership seen by `find` must
    /// agree with `len` and with what `remove` reports, and the set must end up empty.
    pub fn contended<S: ConcurrentSet<u64> + Send + Sync>(set: &S) {
        const RANGE: u64 = 64;
        const OPS: usize = 20_000;

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(move |_| {
                    let mut handle = set.handle();
                    let mut rng = rand::thread_rng();
                    for _ in 0..OPS {
                        let key = rng.gen_range(0..RANGE);
                        match rng.gen_range(0..3) {
                            0 => {
                                set.insert(&mut handle, key);
                            }
                            1 => {
                                set.remove(&mut handle, &key);
                            }
                            _ => {
                                set.find(&mut handle, &key);
                            }
                        }
                    }
                });
            }
        })
        .unwrap();

        let mut handle = set.handle();
        let present = (0..RANGE).filter(|k| set.find(&mut handle, k)).count();
        assert_eq!(present, set.len());
        for key in 0..RANGE {
            let was_present = set.find(&mut handle, &key);
            assert_eq!(set.remove(&mut handle, &key), was_present);
            assert!(!set.find(&mut handle, &key));
        }
        assert!(set.is_empty());
    }
}

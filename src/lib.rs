//! Concurrent ordered sets: an external binary search tree guarded by per-node locks, and a
//! lock-free one whose memory is reclaimed with hazard pointers.

#[macro_use]
extern crate cfg_if;

pub mod asr;
pub mod concurrent_set;
pub mod config;
pub mod fine_grained_tree;
pub mod hp;
pub mod key;
pub mod lock_free_tree;
pub mod registry;

pub use concurrent_set::ConcurrentSet;
pub use fine_grained_tree::FineGrainedBst;
pub use key::{HashKey, IdentityKey, KeyFn};
pub use lock_free_tree::LockFreeBst;
pub use registry::RegistryFull;

cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Reads jemalloc's count of allocated bytes.
        pub struct MemSampler {
            epoch_mib: tikv_jemalloc_ctl::epoch_mib,
            allocated_mib: tikv_jemalloc_ctl::stats::allocated_mib,
        }
        impl MemSampler {
            pub fn new() -> Self {
                MemSampler {
                    epoch_mib: tikv_jemalloc_ctl::epoch::mib().unwrap(),
                    allocated_mib: tikv_jemalloc_ctl::stats::allocated::mib().unwrap(),
                }
            }
            pub fn sample(&self) -> usize {
                self.epoch_mib.advance().unwrap();
                self.allocated_mib.read().unwrap()
            }
        }
    } else {
        pub struct MemSampler {}
        impl MemSampler {
            pub fn new() -> Self {
                tracing::warn!("memory usage sampling is supported only on linux");
                MemSampler {}
            }
            pub fn sample(&self) -> usize {
                0
            }
        }
    }
}

impl Default for MemSampler {
    fn default() -> Self {
        Self::new()
    }
}

//! Hazard-pointer registry.
//!
//! A [`Domain`] owns a fixed table of publication slots, one row per registered [`Thread`]. A
//! thread publishes what it is about to dereference through a [`HazardPointer`], and retires what
//! it unlinked with [`Thread::retire`]. A retired object is freed by a scan of the retiring thread
//! once no slot publishes it.

mod domain;
mod hazard;
mod retire;
mod thread;

pub use domain::{Domain, RETIRE_FACTOR};
pub use hazard::HazardPointer;
pub use thread::Thread;

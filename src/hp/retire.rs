/// A type-erased pointer waiting for reclamation, together with the routine that frees it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Retired {
    pub(crate) ptr: *mut u8,
    deleter: unsafe fn(ptr: *mut u8),
}

// Retired objects are only freed once no thread can reach them, by whichever thread scans.
unsafe impl Send for Retired {}

impl Retired {
    pub(crate) fn new<T>(ptr: *mut T) -> Self {
        Self {
            ptr: ptr as *mut u8,
            deleter: free::<T>,
        }
    }

    /// # Safety
    /// No thread may access the object anymore, and it must not have been freed already.
    pub(crate) unsafe fn execute(self) {
        (self.deleter)(self.ptr)
    }
}

unsafe fn free<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut T))
}

//! Sharing a heap between threads and installing it globally.
//!
//! A [`Heap`] hands out memory through `&mut self`, so using one as the
//! process allocator requires a lock around it. [`LockedHeap`] is that
//! lock, plus the [`GlobalAlloc`] plumbing:
//!
//! ```no_run
//! # #[cfg(unix)] mod demo {
//! use tag_alloc::{Heap, LockedHeap, MmapSource};
//!
//! #[global_allocator]
//! static HEAP: LockedHeap<MmapSource> = LockedHeap::new(Heap::new(MmapSource::new()));
//! # }
//! # fn main() {}
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, NonNull};

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::heap::Heap;
use crate::source::PageSource;

/// A [`Heap`] behind a mutex.
///
/// Construction is `const`, so a `LockedHeap` backed by a `const`
/// constructible source can live in a `static` and serve as the program's
/// `#[global_allocator]`.
pub struct LockedHeap<S: PageSource> {
    inner: Mutex<Heap<S>>,
}

impl<S: PageSource> LockedHeap<S> {
    /// Wraps a heap in a lock.
    pub const fn new(heap: Heap<S>) -> LockedHeap<S> {
        LockedHeap { inner: Mutex::new(heap) }
    }

    /// Acquires the heap, blocking until it is available.
    ///
    /// A panic while the lock was held poisons the mutex; since the heap's
    /// own invariants are restored before any of its methods return, the
    /// poison flag is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Heap<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

unsafe impl<S: PageSource + Send> GlobalAlloc for LockedHeap<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Callers must not pass zero-size layouts; answer with null rather
        // than tripping the heap's contract check.
        if layout.size() == 0 {
            return ptr::null_mut();
        }

        match self.lock().allocate(layout) {
            Ok(block) => block.cast::<u8>().as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.lock().deallocate(ptr) };
        }
    }
}

impl<S: PageSource> fmt::Debug for LockedHeap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedHeap").field("inner", &self.inner).finish()
    }
}

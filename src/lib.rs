//! Boundary-tag heap allocation on demand-mapped pages.
//!
//! [`Heap`] is a classic boundary-tag allocator: every block carries its
//! size and allocation state in a header and footer word, free blocks form
//! an intrusive doubly-linked list threaded through their own payloads, and
//! freed blocks merge immediately with free physical neighbors. Memory
//! arrives in page-granular mappings from a pluggable [`PageSource`], is
//! carved into blocks on demand, and goes back to the source the moment a
//! page holds nothing but one free block.
//!
//! ```
//! # #[cfg(unix)] {
//! use core::alloc::Layout;
//! use tag_alloc::{Heap, MmapSource};
//!
//! let mut heap = Heap::new(MmapSource::new());
//!
//! let layout = Layout::array::<u64>(8).expect("layout overflow");
//! let block = heap.allocate(layout).expect("out of memory");
//!
//! unsafe {
//!     block.cast::<u64>().as_ptr().write(42);
//!     assert_eq!(block.cast::<u64>().as_ptr().read(), 42);
//!
//!     heap.deallocate(block.cast());
//! }
//! # }
//! ```
//!
//! With the `std` feature (enabled by default), [`LockedHeap`] wraps a heap
//! in a mutex and implements [`GlobalAlloc`], so a heap over an
//! [`MmapSource`] can serve as the program's `#[global_allocator]`. Without
//! it the crate is `no_std`.
//!
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![doc(html_root_url = "https://docs.rs/tag_alloc/0.1.0")]

#[cfg(test)]
extern crate std;

mod bump;
mod free_list;
mod heap;
#[cfg(feature = "std")]
mod locked;
mod source;
mod tag;


pub use crate::free_list::SearchMode;
pub use crate::heap::{Heap, HeapConfig};
pub use crate::source::PageSource;
pub use crate::tag::ALIGNMENT;

#[cfg(feature = "std")]
pub use crate::locked::LockedHeap;

#[cfg(unix)]
pub use crate::source::MmapSource;

/// Indicates an allocation failure due to resource exhaustion or an
/// unsupported set of arguments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

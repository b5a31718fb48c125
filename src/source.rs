//! The page source seam.
//!
//! The heap never talks to the operating system directly. It asks a
//! [`PageSource`] for page-aligned mappings and hands them back when a page
//! empties out, which keeps the allocator itself freestanding and lets tests
//! drive it with an instrumented in-process source.

use core::ptr::NonNull;

#[cfg(unix)]
use core::cell::Cell;

/// A supplier of page-granular memory mappings.
///
/// Implementations must report a page size that is a power of two, at least
/// [`ALIGNMENT`](crate::ALIGNMENT), and stable for the lifetime of the
/// source. Successful mappings must be aligned to the page size and valid
/// for reads and writes of the requested length until unmapped.
pub trait PageSource {
    /// The mapping granularity in bytes.
    fn page_size(&self) -> usize;

    /// Maps `len` bytes, a multiple of [`page_size`](Self::page_size).
    ///
    /// Returns `None` if no memory can be supplied; the heap reports that to
    /// its caller as allocation failure.
    fn map(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Releases a mapping.
    ///
    /// # Safety
    ///
    /// `base` and `len` must describe exactly one prior successful
    /// [`map`](Self::map) result that has not yet been unmapped, and no live
    /// pointers into the mapping may remain.
    unsafe fn unmap(&mut self, base: NonNull<u8>, len: usize);
}

/// Page size assumed when `sysconf` cannot report one.
#[cfg(unix)]
const FALLBACK_PAGE_SIZE: usize = 4096;

/// A [`PageSource`] backed by anonymous private `mmap`.
///
/// The system page size is queried lazily and cached, so construction is
/// `const` and an `MmapSource` can live in a `static`.
#[cfg(unix)]
#[derive(Debug)]
pub struct MmapSource {
    page_size: Cell<usize>,
}

#[cfg(unix)]
impl MmapSource {
    /// Creates a source that maps from the operating system.
    pub const fn new() -> MmapSource {
        MmapSource { page_size: Cell::new(0) }
    }
}

#[cfg(unix)]
impl Default for MmapSource {
    fn default() -> MmapSource {
        MmapSource::new()
    }
}

#[cfg(unix)]
impl PageSource for MmapSource {
    fn page_size(&self) -> usize {
        let cached = self.page_size.get();
        if cached != 0 {
            return cached;
        }

        let raw = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        let page_size = usize::try_from(raw).unwrap_or(FALLBACK_PAGE_SIZE);

        self.page_size.set(page_size);
        page_size
    }

    fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        debug_assert!(len % self.page_size() == 0);

        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(raw.cast::<u8>())
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, len: usize) {
        // On failure the mapping leaks; there is no way to recover here.
        let rc = unsafe { libc::munmap(base.as_ptr().cast(), len) };
        debug_assert_eq!(rc, 0, "munmap rejected a mapping produced by map");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use core::alloc::Layout;
    use core::slice;

    use crate::heap::Heap;

    #[test]
    fn page_size_is_a_power_of_two_and_cached() {
        let source = MmapSource::new();
        let page_size = source.page_size();

        assert!(page_size.is_power_of_two());
        assert!(page_size >= crate::ALIGNMENT);
        assert_eq!(source.page_size(), page_size);
    }

    #[test]
    fn map_round_trip() {
        let mut source = MmapSource::new();
        let len = 2 * source.page_size();

        let base = source.map(len).unwrap();
        assert_eq!(base.addr().get() % source.page_size(), 0);

        unsafe {
            base.as_ptr().write(0xaa);
            base.as_ptr().add(len - 1).write(0xbb);
            assert_eq!(base.as_ptr().read(), 0xaa);

            source.unmap(base, len);
        }
    }

    #[test]
    fn heap_allocations_carve_real_pages() {
        let mut heap = Heap::new(MmapSource::new());
        let layout = Layout::from_size_align(4000, 8).unwrap();

        let block = heap.allocate(layout).unwrap();
        unsafe {
            let bytes = slice::from_raw_parts_mut(block.cast::<u8>().as_ptr(), 4000);
            bytes.fill(0x5a);
            assert!(bytes.iter().all(|&b| b == 0x5a));

            heap.deallocate(block.cast());
        }

        // The freed span is found again on the next request of the same size.
        let again = heap.allocate(layout).unwrap();
        assert_eq!(again.cast::<u8>(), block.cast::<u8>());
        unsafe { heap.deallocate(again.cast()) };
    }
}

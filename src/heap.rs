//! The boundary-tag heap.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation           | Best-case | Worst-case                 |
//! |---------------------|-----------|----------------------------|
//! | Allocate            | O(1)      | O(f), f = free blocks      |
//! | Deallocate          | O(1)      | O(1)                       |
//!
//! Allocation searches the free list and falls back to carving the current
//! page, mapping a new one only when both fail. Deallocation coalesces with
//! at most two physical neighbors and unmaps a page the moment it holds
//! nothing but one free block.
//!
//! #### Fragmentation
//!
//! Reused blocks are handed out whole, so internal fragmentation is bounded
//! by the spread of request sizes hitting the same list. External
//! fragmentation is kept down by immediate coalescing, which guarantees no
//! two free blocks are ever physical neighbors.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use crate::bump::BumpRegion;
use crate::free_list::{FreeList, SearchMode, MIN_BLOCK_SIZE};
use crate::source::PageSource;
use crate::tag::{align_up, page_align_up, BlockPtr, Tag, ALIGNMENT, OVERHEAD, PAGE_OVERHEAD};
use crate::AllocError;

const DEFAULT_GROWTH_FACTOR: usize = 32;

/// Tuning knobs for a [`Heap`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HeapConfig {
    /// How to choose among free blocks that could satisfy a request.
    pub search: SearchMode,
    /// Over-allocation multiplier for fresh page mappings.
    ///
    /// When a request cannot be satisfied from the free list or the current
    /// page, the new mapping is sized to `growth_factor` times the request
    /// before rounding up to the page size, so one mapping amortizes many
    /// small allocations. Must be at least 1; defaults to 32.
    pub growth_factor: usize,
}

impl HeapConfig {
    /// Returns the default configuration: first-fit search, growth factor
    /// of 32.
    pub const fn new() -> HeapConfig {
        HeapConfig {
            search: SearchMode::FirstFit,
            growth_factor: DEFAULT_GROWTH_FACTOR,
        }
    }
}

impl Default for HeapConfig {
    fn default() -> HeapConfig {
        HeapConfig::new()
    }
}

/// A boundary-tag heap drawing pages from a [`PageSource`].
///
/// Every block is bracketed by a header and footer tag word, mapped pages
/// are bracketed by sentinel tags, and free blocks form an intrusive list
/// threaded through their payloads. Freed blocks are immediately merged
/// with free physical neighbors, and a page reduced to a single free block
/// is returned to the source.
///
/// All payloads are aligned to [`ALIGNMENT`]; requests for stricter
/// alignment fail with [`AllocError`].
///
/// Dropping the heap unmaps nothing. Pages still mapped at that point are
/// left to the source, so a heap that should not outlive its memory must
/// deallocate its blocks first.
pub struct Heap<S: PageSource> {
    pub(crate) free_list: FreeList,
    pub(crate) bump: BumpRegion,
    pub(crate) source: S,
    config: HeapConfig,
}

// The heap owns every page its internal pointers reference, so moving it to
// another thread moves the blocks' ownership along with it.
unsafe impl<S: PageSource + Send> Send for Heap<S> {}

impl<S: PageSource> Heap<S> {
    /// Creates an empty heap with the default [`HeapConfig`].
    ///
    /// No pages are mapped until the first allocation.
    pub const fn new(source: S) -> Heap<S> {
        Heap::with_config(source, HeapConfig::new())
    }

    /// Creates an empty heap with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if `config.growth_factor` is zero.
    pub const fn with_config(source: S, config: HeapConfig) -> Heap<S> {
        assert!(config.growth_factor >= 1, "growth factor must be at least 1");

        Heap {
            free_list: FreeList::new(),
            bump: BumpRegion::new(),
            source,
            config,
        }
    }

    /// Returns a reference to the page source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Attempts to allocate a block of memory according to `layout`.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`] and valid for reads
    /// and writes of `layout.size()` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the page source cannot supply enough memory, if
    /// `layout.align()` exceeds [`ALIGNMENT`], or if the sized mapping
    /// request would overflow `usize`.
    ///
    /// # Panics
    ///
    /// Panics if `layout.size()` is zero.
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        assert!(layout.size() != 0, "allocation size must be nonzero");

        if layout.align() > ALIGNMENT {
            return Err(AllocError);
        }

        // Layout sizes cannot exceed isize::MAX, so adding the tag overhead
        // cannot overflow.
        let needed = align_up(layout.size() + OVERHEAD, ALIGNMENT).max(MIN_BLOCK_SIZE);

        if let Some(block) = unsafe { self.free_list.find_fit(needed, self.config.search) } {
            unsafe {
                self.free_list.remove(block);

                // The block is reused whole. Splitting would shrink its
                // tags and orphan the tail, so oversized hits keep their
                // full span and give it all back on release.
                let size = block.header().size();
                block.set_tags(Tag::Block { size, allocated: true });
            }

            return Ok(slice_ptr(block, layout.size()));
        }

        if self.bump.remaining() < needed {
            self.map_fresh_page(needed)?;
        }

        let block = unsafe { self.bump.carve(needed) }
            .expect("a freshly mapped page accommodates the request that sized it");

        Ok(slice_ptr(block, layout.size()))
    }

    /// Retires the current bump page and maps a new one large enough for
    /// `needed`, sized up by the configured growth factor. The retired
    /// page's remainder is freed like a released block, so it can merge
    /// with a free neighbor or take a wholly-free page back to the source.
    fn map_fresh_page(&mut self, needed: usize) -> Result<(), AllocError> {
        // The leftover is released like a freed block: its predecessor may
        // already be free, and a page left wholly free here goes back to
        // the source instead of lingering unmergeable.
        if let Some(leftover) = unsafe { self.bump.retire() } {
            unsafe {
                let size = leftover.header().size();
                let merged = self.coalesce(leftover, size);
                self.reclaim(merged);
            }
        }

        let page_size = self.source.page_size();
        debug_assert!(page_size.is_power_of_two() && page_size >= ALIGNMENT);

        let want = needed
            .checked_mul(self.config.growth_factor)
            .and_then(|n| n.checked_add(PAGE_OVERHEAD))
            .ok_or(AllocError)?;

        if want > usize::MAX - (page_size - 1) {
            return Err(AllocError);
        }
        let len = page_align_up(want, page_size);

        let base = self.source.map(len).ok_or(AllocError)?;
        unsafe { self.bump.reload(base, len) };

        Ok(())
    }

    /// Deallocates the block of memory at `ptr`.
    ///
    /// The block is merged with any free physical neighbors, and if the
    /// merged block is the only thing left in its page, the page is
    /// returned to the source.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not aligned to [`ALIGNMENT`], if its header does
    /// not describe an allocated block, or if the header and footer
    /// disagree. Any of these means the pointer was not allocated by this
    /// heap, was already deallocated, or the block's tags were overwritten.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory [*currently allocated*] via this
    /// heap.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        assert!(
            ptr.addr().get() % ALIGNMENT == 0,
            "released pointer is not aligned to a block payload"
        );

        let block = BlockPtr::new(ptr);
        let header = unsafe { block.header() };

        let size = match header {
            Tag::Block { size, allocated: true } => size,
            _ => panic!("released pointer does not denote an allocated block"),
        };

        let footer = unsafe { block.footer(size) };
        assert!(footer == header, "block header and footer disagree");

        unsafe {
            block.set_tags(Tag::Block { size, allocated: false });
            let merged = self.coalesce(block, size);
            self.reclaim(merged);
        }
    }

    /// Merges a just-freed block with its free physical neighbors and
    /// returns the merged block, which is always resident in the free list
    /// afterwards.
    ///
    /// # Safety
    ///
    /// `block` must be a freed block of `size` bytes, tagged but not yet in
    /// the list.
    unsafe fn coalesce(&mut self, block: BlockPtr, size: usize) -> BlockPtr {
        let prev = unsafe { block.prev_tag() };
        let next = unsafe { block.next_tag(size) };

        debug_assert!(!prev.is_free() || prev.size() >= MIN_BLOCK_SIZE);
        debug_assert!(!next.is_free() || next.size() >= MIN_BLOCK_SIZE);

        match (prev.is_free(), next.is_free()) {
            (false, false) => {
                unsafe { self.free_list.push(block) };
                block
            }

            // The preceding block is already listed; growing it in place
            // keeps its links untouched.
            (true, false) => unsafe {
                let merged = block.prev_block(prev.size());
                merged.set_tags(Tag::Block { size: prev.size() + size, allocated: false });
                merged
            },

            (false, true) => unsafe {
                self.free_list.remove(block.next_block(size));
                block.set_tags(Tag::Block { size: size + next.size(), allocated: false });
                self.free_list.push(block);
                block
            },

            (true, true) => unsafe {
                self.free_list.remove(block.next_block(size));
                let merged = block.prev_block(prev.size());
                merged.set_tags(Tag::Block {
                    size: prev.size() + size + next.size(),
                    allocated: false,
                });
                merged
            },
        }
    }

    /// Unmaps the page containing `merged` if the page holds nothing else.
    ///
    /// Both neighbors being sentinels means the free block spans the whole
    /// interior, so the page's base and length can be recovered from the
    /// block itself.
    ///
    /// # Safety
    ///
    /// `merged` must be a coalesced free block resident in the free list.
    unsafe fn reclaim(&mut self, merged: BlockPtr) {
        unsafe {
            let size = merged.header().size();

            if merged.prev_tag() != Tag::Sentinel || merged.next_tag(size) != Tag::Sentinel {
                return;
            }

            self.free_list.remove(merged);
            self.source.unmap(merged.page_base(), size + PAGE_OVERHEAD);
        }
    }

    /// Returns the heap to its empty state without unmapping anything.
    ///
    /// All pages the heap still holds are abandoned to the source's
    /// mappings; the heap itself forgets them and starts fresh. Calling
    /// this on an already-empty heap is a no-op.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - No references to memory allocated by this heap may exist when the
    ///   method is called.
    /// - Any pointers to memory previously allocated by this heap may no
    ///   longer be dereferenced or passed to [`Heap::deallocate`].
    pub unsafe fn reset(&mut self) {
        self.free_list = FreeList::new();
        self.bump = BumpRegion::new();
    }
}

impl<S: PageSource> fmt::Debug for Heap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("free_list", &self.free_list)
            .field("bump", &self.bump)
            .field("config", &self.config)
            .finish()
    }
}

/// Widens a block's payload pointer to the slice the caller asked for.
fn slice_ptr(block: BlockPtr, len: usize) -> NonNull<[u8]> {
    NonNull::slice_from_raw_parts(block.payload(), len)
}

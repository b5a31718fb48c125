//! The intrusive free list.
//!
//! Free blocks store their list links inside their own payload bytes, so the
//! list costs no memory beyond one head pointer. That is also what dictates
//! the minimum block size: every block must be able to hold a [`FreeLink`]
//! when it is free.
//!
//! Blocks are pushed at the head, so the list is ordered most recently freed
//! first and searches favor recently released blocks. Removal unlinks in
//! O(1) from anywhere in the list, which coalescing relies on.

#[cfg(test)]
use core::ptr::NonNull;

use crate::tag::{BlockPtr, OVERHEAD};

/// Smallest admissible block size in bytes.
///
/// Two tag words plus room for the intrusive links of a free block.
pub(crate) const MIN_BLOCK_SIZE: usize = OVERHEAD + core::mem::size_of::<FreeLink>();

/// Policy for choosing among free blocks that could satisfy a request.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum SearchMode {
    /// Take the first block large enough, scanning from the most recently
    /// freed. Constant-factor cheap and reuses warm blocks.
    #[default]
    FirstFit,
    /// Scan the whole list and take the smallest block large enough,
    /// preferring the more recently freed among equals. Slower, but wastes
    /// less of each reused block.
    BestFit,
}

/// Link words stored in the payload of every free block.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub(crate) struct FreeLink {
    prev: Option<BlockPtr>,
    next: Option<BlockPtr>,
}

/// Returns the location of `block`'s intrusive links.
///
/// # Safety
///
/// Dereferencing the returned pointer requires `block` to be free and its
/// payload to be at least `size_of::<FreeLink>()` bytes.
unsafe fn link_ptr(block: BlockPtr) -> *mut FreeLink {
    block.payload().as_ptr().cast()
}

/// A doubly-linked list threaded through the payloads of free blocks.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: Option<BlockPtr>,
}

impl FreeList {
    /// Creates an empty list.
    pub(crate) const fn new() -> FreeList {
        FreeList { head: None }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[cfg(test)]
    pub(crate) fn head(&self) -> Option<BlockPtr> {
        self.head
    }

    /// Pushes a free block at the head of the list.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of at least [`MIN_BLOCK_SIZE`] bytes
    /// that is not already in the list.
    pub(crate) unsafe fn push(&mut self, block: BlockPtr) {
        debug_assert!(unsafe { block.header() }.is_free());

        unsafe {
            link_ptr(block).write(FreeLink { prev: None, next: self.head });

            if let Some(old_head) = self.head {
                (*link_ptr(old_head)).prev = Some(block);
            }
        }

        self.head = Some(block);
    }

    /// Unlinks a block from anywhere in the list.
    ///
    /// # Safety
    ///
    /// `block` must currently be in this list.
    pub(crate) unsafe fn remove(&mut self, block: BlockPtr) {
        let link = unsafe { link_ptr(block).read() };

        match link.prev {
            Some(prev) => unsafe { (*link_ptr(prev)).next = link.next },
            None => self.head = link.next,
        }

        if let Some(next) = link.next {
            unsafe { (*link_ptr(next)).prev = link.prev };
        }
    }

    /// Finds a free block of at least `min_size` bytes, or `None` if no
    /// listed block is large enough.
    ///
    /// The returned block is left in the list; callers that allocate it
    /// must [`remove`](Self::remove) it first.
    ///
    /// # Safety
    ///
    /// Every block in the list must be a valid free block with intact tags
    /// and links.
    pub(crate) unsafe fn find_fit(&self, min_size: usize, mode: SearchMode) -> Option<BlockPtr> {
        let mut best: Option<(usize, BlockPtr)> = None;
        let mut cursor = self.head;

        while let Some(block) = cursor {
            let size = unsafe { block.header() }.size();

            if size >= min_size {
                match mode {
                    SearchMode::FirstFit => return Some(block),
                    SearchMode::BestFit => {
                        if best.map_or(true, |(best_size, _)| size < best_size) {
                            best = Some((size, block));
                        }
                    }
                }
            }

            cursor = unsafe { (*link_ptr(block)).next };
        }

        best.map(|(_, block)| block)
    }

    /// Collects the payload pointers of all listed blocks in list order.
    ///
    /// # Safety
    ///
    /// Same contract as [`find_fit`](Self::find_fit).
    #[cfg(test)]
    pub(crate) unsafe fn payloads(&self) -> std::vec::Vec<NonNull<u8>> {
        let mut out = std::vec::Vec::new();
        let mut cursor = self.head;

        while let Some(block) = cursor {
            out.push(block.payload());
            cursor = unsafe { (*link_ptr(block)).next };
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Tag, ALIGNMENT, WORD};

    #[repr(align(16))]
    struct Arena([u8; 1024]);

    /// Carves `sizes` into free blocks laid end to end in `arena` and
    /// returns them in carving order. The blocks are tagged free but not
    /// yet listed.
    fn carve(arena: &mut Arena, sizes: &[usize]) -> std::vec::Vec<BlockPtr> {
        let mut blocks = std::vec::Vec::new();
        let mut at = unsafe { arena.0.as_mut_ptr().add(WORD) };

        for &size in sizes {
            assert!(size >= MIN_BLOCK_SIZE && size % ALIGNMENT == 0);
            let block = BlockPtr::new(NonNull::new(unsafe { at.add(WORD) }).unwrap());
            unsafe { block.set_tags(Tag::Block { size, allocated: false }) };
            blocks.push(block);
            at = unsafe { at.add(size) };
        }

        blocks
    }

    #[test]
    fn push_orders_most_recent_first() {
        let mut arena = Arena([0; 1024]);
        let blocks = carve(&mut arena, &[32, 32, 32]);
        let mut list = FreeList::new();

        assert!(list.is_empty());

        unsafe {
            for &block in &blocks {
                list.push(block);
            }

            assert_eq!(list.head(), Some(blocks[2]));

            let order = list.payloads();
            assert_eq!(order.len(), 3);
            assert_eq!(order[0], blocks[2].payload());
            assert_eq!(order[1], blocks[1].payload());
            assert_eq!(order[2], blocks[0].payload());
        }
    }

    #[test]
    fn remove_from_head_middle_and_tail() {
        let mut arena = Arena([0; 1024]);
        let blocks = carve(&mut arena, &[32, 32, 32, 32]);
        let mut list = FreeList::new();

        unsafe {
            for &block in &blocks {
                list.push(block);
            }

            // List order is [3, 2, 1, 0].
            list.remove(blocks[2]);
            assert_eq!(list.payloads(), [blocks[3], blocks[1], blocks[0]].map(BlockPtr::payload));

            list.remove(blocks[3]);
            assert_eq!(list.payloads(), [blocks[1], blocks[0]].map(BlockPtr::payload));

            list.remove(blocks[0]);
            assert_eq!(list.payloads(), [blocks[1].payload()]);

            list.remove(blocks[1]);
            assert!(list.is_empty());
        }
    }

    #[test]
    fn first_fit_prefers_recently_freed() {
        let mut arena = Arena([0; 1024]);
        let blocks = carve(&mut arena, &[64, 48, 64]);
        let mut list = FreeList::new();

        unsafe {
            for &block in &blocks {
                list.push(block);
            }

            // Both 64-byte blocks fit; the most recently pushed one wins.
            let hit = list.find_fit(64, SearchMode::FirstFit);
            assert_eq!(hit, Some(blocks[2]));

            assert_eq!(list.find_fit(128, SearchMode::FirstFit), None);
        }
    }

    #[test]
    fn best_fit_prefers_smallest_adequate() {
        let mut arena = Arena([0; 1024]);
        let blocks = carve(&mut arena, &[128, 48, 64]);
        let mut list = FreeList::new();

        unsafe {
            for &block in &blocks {
                list.push(block);
            }

            // First fit stops at the 64-byte head; best fit keeps looking
            // and lands on the exact 48-byte block.
            assert_eq!(list.find_fit(48, SearchMode::FirstFit), Some(blocks[2]));
            assert_eq!(list.find_fit(48, SearchMode::BestFit), Some(blocks[1]));
            assert_eq!(list.find_fit(96, SearchMode::BestFit), Some(blocks[0]));
            assert_eq!(list.find_fit(256, SearchMode::BestFit), None);
        }
    }

    #[test]
    fn min_block_size_holds_a_link() {
        assert_eq!(MIN_BLOCK_SIZE, 32);
        assert!(core::mem::size_of::<FreeLink>() <= MIN_BLOCK_SIZE - OVERHEAD);
        assert!(core::mem::align_of::<FreeLink>() <= ALIGNMENT);
    }
}

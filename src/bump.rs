//! Bump carving of freshly mapped pages.
//!
//! New pages are not split into blocks up front. The region keeps a cursor
//! into the most recently mapped page and carves blocks off its low end on
//! demand; the uncarved remainder only becomes a real free block when the
//! region is retired in favor of a new page.
//!
//! The remainder is nonetheless kept covered at all times: a placeholder
//! header and footer spanning the whole uncarved tail are rewritten after
//! every carve, tagged allocated. Neighbor scans from blocks earlier in the
//! page therefore always read an initialized tag, and because the
//! placeholder reads as allocated, no block in a live bump page can ever
//! look mergeable with the tail or reach the terminator sentinel. That also
//! keeps the page itself from being unmapped while the cursor still points
//! into it.

use core::ptr::NonNull;

use crate::free_list::MIN_BLOCK_SIZE;
use crate::tag::{self, BlockPtr, Tag, ALIGNMENT, PAGE_OVERHEAD, WORD};

/// Carving state for the most recently mapped page.
///
/// `cursor` is the address of the next block header to hand out and
/// `remaining` the bytes from there to the terminator sentinel. The two move
/// in lockstep: the cursor is `None` exactly when `remaining` is zero.
#[derive(Debug)]
pub(crate) struct BumpRegion {
    cursor: Option<NonNull<u8>>,
    remaining: usize,
}

impl BumpRegion {
    /// Creates an exhausted region with no page.
    pub(crate) const fn new() -> BumpRegion {
        BumpRegion { cursor: None, remaining: 0 }
    }

    /// Bytes still carvable from the current page.
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    /// Seeds a fresh mapping and points the region at it.
    ///
    /// Writes the prolog sentinel at `base`, the terminator sentinel in the
    /// last word and a placeholder tag pair covering the whole interior.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes, aligned to
    /// [`ALIGNMENT`], and owned by the caller. Any previous page must have
    /// been retired first.
    pub(crate) unsafe fn reload(&mut self, base: NonNull<u8>, len: usize) {
        debug_assert!(self.cursor.is_none());
        debug_assert!(len % ALIGNMENT == 0);
        debug_assert!(len >= PAGE_OVERHEAD + MIN_BLOCK_SIZE);
        debug_assert!(base.addr().get() % ALIGNMENT == 0);

        let interior = len - PAGE_OVERHEAD;

        unsafe {
            tag::write_word(base.as_ptr(), Tag::Sentinel);
            tag::write_word(base.as_ptr().add(len - WORD), Tag::Sentinel);

            let cursor = NonNull::new_unchecked(base.as_ptr().add(WORD));
            cover(cursor, interior);

            self.cursor = Some(cursor);
        }

        self.remaining = interior;
    }

    /// Carves an allocated block off the low end of the current page, or
    /// returns `None` if the remainder is too small (or there is no page at
    /// all).
    ///
    /// When carving would leave a remainder smaller than [`MIN_BLOCK_SIZE`],
    /// the carved block absorbs it, so the leftover is always either zero or
    /// a viable block. `needed` must be a multiple of [`ALIGNMENT`] no
    /// smaller than [`MIN_BLOCK_SIZE`].
    ///
    /// # Safety
    ///
    /// The region's page must still be mapped.
    pub(crate) unsafe fn carve(&mut self, needed: usize) -> Option<BlockPtr> {
        debug_assert!(needed >= MIN_BLOCK_SIZE && needed % ALIGNMENT == 0);

        let cursor = self.cursor?;
        if self.remaining < needed {
            return None;
        }

        let mut size = needed;
        let after = self.remaining - needed;
        if after < MIN_BLOCK_SIZE {
            size += after;
        }

        let block = unsafe {
            let block = BlockPtr::new(NonNull::new_unchecked(cursor.as_ptr().add(WORD)));
            block.set_tags(Tag::Block { size, allocated: true });
            block
        };

        self.remaining -= size;
        self.cursor = if self.remaining == 0 {
            None
        } else {
            unsafe {
                let next = NonNull::new_unchecked(cursor.as_ptr().add(size));
                cover(next, self.remaining);
                Some(next)
            }
        };

        Some(block)
    }

    /// Gives up on the current page, converting the uncarved remainder into
    /// a free block for the caller to publish. Returns `None` if the region
    /// was already exhausted.
    ///
    /// # Safety
    ///
    /// The region's page must still be mapped.
    pub(crate) unsafe fn retire(&mut self) -> Option<BlockPtr> {
        let cursor = self.cursor.take()?;
        let size = self.remaining;
        self.remaining = 0;

        // The fold rule in carve keeps the remainder viable or zero.
        debug_assert!(size >= MIN_BLOCK_SIZE);

        Some(unsafe {
            let block = BlockPtr::new(NonNull::new_unchecked(cursor.as_ptr().add(WORD)));
            block.set_tags(Tag::Block { size, allocated: false });
            block
        })
    }
}

/// Writes the placeholder tag pair covering `len` bytes at `cursor`, shaped
/// like an allocated block spanning the whole uncarved remainder.
///
/// # Safety
///
/// `cursor` through `cursor + len` must lie within the current page.
unsafe fn cover(cursor: NonNull<u8>, len: usize) {
    debug_assert!(len >= MIN_BLOCK_SIZE);

    unsafe {
        let payload = NonNull::new_unchecked(cursor.as_ptr().add(WORD));
        BlockPtr::new(payload).set_tags(Tag::Block { size: len, allocated: true });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Arena([u8; 1024]);

    fn region_over(arena: &mut Arena) -> (BumpRegion, NonNull<u8>) {
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        let mut region = BumpRegion::new();
        unsafe { region.reload(base, 1024) };
        (region, base)
    }

    unsafe fn word_at(base: NonNull<u8>, offset: usize) -> Tag {
        unsafe { tag::read_word(base.as_ptr().add(offset)) }
    }

    #[test]
    fn reload_seeds_sentinels_and_placeholder() {
        let mut arena = Arena([0; 1024]);
        let (region, base) = region_over(&mut arena);

        assert_eq!(region.remaining(), 1024 - PAGE_OVERHEAD);

        unsafe {
            assert_eq!(word_at(base, 0), Tag::Sentinel);
            assert_eq!(word_at(base, 1024 - WORD), Tag::Sentinel);

            let placeholder = Tag::Block { size: 1008, allocated: true };
            assert_eq!(word_at(base, WORD), placeholder);
            assert_eq!(word_at(base, 1024 - 2 * WORD), placeholder);
        }
    }

    #[test]
    fn carve_advances_and_rewrites_placeholder() {
        let mut arena = Arena([0; 1024]);
        let (mut region, base) = region_over(&mut arena);

        unsafe {
            let a = region.carve(64).unwrap();
            assert_eq!(a.payload().as_ptr(), base.as_ptr().add(2 * WORD));
            assert_eq!(a.header(), Tag::Block { size: 64, allocated: true });
            assert_eq!(a.footer(64), a.header());
            assert_eq!(region.remaining(), 1008 - 64);

            // The placeholder now starts where the carved block ends.
            let tail = Tag::Block { size: 1008 - 64, allocated: true };
            assert_eq!(word_at(base, WORD + 64), tail);
            assert_eq!(word_at(base, 1024 - 2 * WORD), tail);

            let b = region.carve(128).unwrap();
            assert_eq!(b.payload().as_ptr(), base.as_ptr().add(2 * WORD + 64));
            assert_eq!(region.remaining(), 1008 - 64 - 128);
        }
    }

    #[test]
    fn carve_folds_small_remainders() {
        let mut arena = Arena([0; 1024]);
        let (mut region, _) = region_over(&mut arena);

        unsafe {
            // 1008 - 992 leaves 16 bytes, less than a viable block, so the
            // carved block absorbs them.
            let block = region.carve(992).unwrap();
            assert_eq!(block.header().size(), 1008);
            assert_eq!(region.remaining(), 0);
            assert!(region.carve(MIN_BLOCK_SIZE).is_none());
        }
    }

    #[test]
    fn carve_declines_when_short() {
        let mut arena = Arena([0; 1024]);
        let (mut region, _) = region_over(&mut arena);

        unsafe {
            assert!(region.carve(2048).is_none());
            assert_eq!(region.remaining(), 1008);
        }

        let mut empty = BumpRegion::new();
        unsafe {
            assert!(empty.carve(MIN_BLOCK_SIZE).is_none());
        }
    }

    #[test]
    fn retire_yields_the_remainder_as_a_free_block() {
        let mut arena = Arena([0; 1024]);
        let (mut region, base) = region_over(&mut arena);

        unsafe {
            region.carve(64).unwrap();

            let leftover = region.retire().unwrap();
            assert_eq!(leftover.payload().as_ptr(), base.as_ptr().add(2 * WORD + 64));
            assert_eq!(leftover.header(), Tag::Block { size: 1008 - 64, allocated: false });
            assert_eq!(leftover.footer(1008 - 64), leftover.header());

            assert_eq!(region.remaining(), 0);
            assert!(region.retire().is_none());
        }
    }
}

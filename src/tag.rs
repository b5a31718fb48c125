//! Boundary-tag encoding and block geometry.
//!
//! Every block managed by the heap is bracketed by a header and a footer
//! holding the same tag word, so a block's size and allocation state can be
//! read from either end and both physical neighbors can be located in O(1):
//!
//! ```text
//!            header                                     footer
//!           +--------+---------------------------------+--------+
//!           | size|a |            payload              | size|a |
//!           +--------+---------------------------------+--------+
//!           ^        ^
//!           |        payload pointer (what callers hold)
//!           payload - WORD
//! ```
//!
//! Block sizes count the full span, header and footer included, and are
//! always multiples of [`ALIGNMENT`]. That leaves the low four bits of the
//! tag word free; bit 0 carries the allocated flag. A tag of size zero with
//! the allocated bit set is a [sentinel], the marker written at both ends of
//! every mapped page.
//!
//! [sentinel]: Tag::Sentinel

use core::ptr::NonNull;

/// Size of one tag word in bytes.
pub(crate) const WORD: usize = core::mem::size_of::<usize>();

/// Alignment unit for block sizes and payload addresses.
///
/// Payloads handed out by the heap are always aligned to this many bytes.
pub const ALIGNMENT: usize = 16;

/// Bytes of bookkeeping carried by every block (header plus footer).
pub(crate) const OVERHEAD: usize = 2 * WORD;

/// Bytes consumed by the two sentinel words of a mapped page.
pub(crate) const PAGE_OVERHEAD: usize = 2 * WORD;

const ALLOCATED_BIT: usize = 0b1;
const SIZE_MASK: usize = !(ALIGNMENT - 1);

/// A decoded boundary tag.
///
/// The encoded form is a single word with the size in the high bits and the
/// allocated flag in bit 0. Decoding separates the one reserved encoding,
/// "allocated, size zero", into its own variant so page edges cannot be
/// mistaken for blocks.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Tag {
    /// Page-edge marker. Its word form reads as allocated with size zero,
    /// which makes every neighbor scan branch-free: walking past the end of
    /// a page reads as bumping into an allocated block.
    Sentinel,
    /// An ordinary block of `size` bytes, header and footer included.
    Block {
        /// Full span of the block in bytes, a nonzero multiple of
        /// [`ALIGNMENT`].
        size: usize,
        /// Whether the block is currently allocated.
        allocated: bool,
    },
}

impl Tag {
    /// Encodes the tag into its word form.
    ///
    /// Passing a `Block` whose size is zero or not a multiple of
    /// [`ALIGNMENT`] is a caller contract violation; the low bits of the
    /// size would collide with the flag bits.
    pub(crate) fn pack(self) -> usize {
        match self {
            Tag::Sentinel => ALLOCATED_BIT,
            Tag::Block { size, allocated } => {
                debug_assert!(size != 0, "block tags must have nonzero size");
                debug_assert!(
                    size & !SIZE_MASK == 0,
                    "block sizes must be multiples of the alignment unit"
                );
                size | usize::from(allocated)
            }
        }
    }

    /// Decodes a tag word. Total: every word decodes to some tag.
    pub(crate) fn unpack(word: usize) -> Tag {
        let size = word & SIZE_MASK;
        let allocated = word & ALLOCATED_BIT != 0;

        if size == 0 && allocated {
            Tag::Sentinel
        } else {
            Tag::Block { size, allocated }
        }
    }

    /// Returns the tagged size. Sentinels report zero.
    pub(crate) fn size(self) -> usize {
        match self {
            Tag::Sentinel => 0,
            Tag::Block { size, .. } => size,
        }
    }

    /// Returns `true` for a free block. Sentinels are never free, which is
    /// what terminates coalescing at page edges.
    pub(crate) fn is_free(self) -> bool {
        matches!(self, Tag::Block { allocated: false, .. })
    }
}

/// Writes a tag word at `at`.
///
/// # Safety
///
/// `at` must be valid for writes of one `usize` and aligned to [`WORD`].
pub(crate) unsafe fn write_word(at: *mut u8, tag: Tag) {
    unsafe { at.cast::<usize>().write(tag.pack()) }
}

/// Reads a tag word at `at`.
///
/// # Safety
///
/// `at` must be valid for reads of one `usize`, aligned to [`WORD`], and
/// hold a previously written tag word.
pub(crate) unsafe fn read_word(at: *const u8) -> Tag {
    Tag::unpack(unsafe { at.cast::<usize>().read() })
}

/// Rounds `n` up to the next multiple of `unit`.
///
/// `unit` must be a power of two. The sum is computed with plain wrapping
/// semantics; callers bound `n` first when it can approach `usize::MAX`.
pub(crate) fn align_up(n: usize, unit: usize) -> usize {
    debug_assert!(unit.is_power_of_two());
    (n + unit - 1) & !(unit - 1)
}

/// Rounds a mapping request up to the next multiple of the page size.
pub(crate) fn page_align_up(n: usize, page_size: usize) -> usize {
    align_up(n, page_size)
}

/// A pointer to a block, held as its payload address.
///
/// All header, footer and neighbor arithmetic lives here, so the offset
/// juggling is written once and every access point asserts the alignment
/// invariant in debug builds. The footer position depends on the block's
/// size, which accessors take explicitly; reads of an untrusted header are
/// validated by the caller before the size is used to locate anything else.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct BlockPtr {
    payload: NonNull<u8>,
}

impl BlockPtr {
    /// Wraps a payload pointer.
    pub(crate) fn new(payload: NonNull<u8>) -> BlockPtr {
        debug_assert!(
            payload.addr().get() & (ALIGNMENT - 1) == 0,
            "payload addresses are aligned to the alignment unit"
        );
        BlockPtr { payload }
    }

    /// Returns the payload pointer.
    #[inline]
    pub(crate) fn payload(self) -> NonNull<u8> {
        self.payload
    }

    /// Reads this block's header tag.
    ///
    /// # Safety
    ///
    /// The word immediately before the payload must be an initialized tag
    /// within the block's page.
    pub(crate) unsafe fn header(self) -> Tag {
        unsafe { read_word(self.payload.as_ptr().sub(WORD)) }
    }

    /// Reads this block's footer tag, given the block's size.
    ///
    /// # Safety
    ///
    /// `size` must be the block's true span so the footer word lies within
    /// the block, initialized.
    pub(crate) unsafe fn footer(self, size: usize) -> Tag {
        unsafe { read_word(self.payload.as_ptr().add(size - OVERHEAD)) }
    }

    /// Writes `tag` to both the header and the footer slots.
    ///
    /// # Safety
    ///
    /// The whole span described by the tag's size, starting one word before
    /// the payload, must lie within a single mapped page owned by the heap.
    pub(crate) unsafe fn set_tags(self, tag: Tag) {
        debug_assert!(matches!(tag, Tag::Block { .. }));
        let size = tag.size();

        unsafe {
            write_word(self.payload.as_ptr().sub(WORD), tag);
            write_word(self.payload.as_ptr().add(size - OVERHEAD), tag);
        }
    }

    /// Reads the footer tag of the physically preceding block or sentinel.
    ///
    /// # Safety
    ///
    /// The block must live inside a seeded page, so the two words before the
    /// payload are initialized tags.
    pub(crate) unsafe fn prev_tag(self) -> Tag {
        unsafe { read_word(self.payload.as_ptr().sub(OVERHEAD)) }
    }

    /// Reads the header tag of the physically following block or sentinel.
    ///
    /// # Safety
    ///
    /// `size` must be the block's true span and the block must live inside a
    /// seeded page, so the word past the footer is an initialized tag.
    pub(crate) unsafe fn next_tag(self, size: usize) -> Tag {
        unsafe { read_word(self.payload.as_ptr().add(size - WORD)) }
    }

    /// Returns the physically preceding block, given its size as read from
    /// [`prev_tag`](Self::prev_tag).
    ///
    /// # Safety
    ///
    /// The preceding tag must denote a real block (not a sentinel) of
    /// `prev_size` bytes.
    pub(crate) unsafe fn prev_block(self, prev_size: usize) -> BlockPtr {
        debug_assert!(prev_size != 0);
        BlockPtr::new(unsafe {
            NonNull::new_unchecked(self.payload.as_ptr().sub(prev_size))
        })
    }

    /// Returns the physically following block.
    ///
    /// # Safety
    ///
    /// `size` must be the block's true span and the following tag must
    /// denote a real block.
    pub(crate) unsafe fn next_block(self, size: usize) -> BlockPtr {
        BlockPtr::new(unsafe {
            NonNull::new_unchecked(self.payload.as_ptr().add(size))
        })
    }

    /// Returns the base of the page containing this block.
    ///
    /// Only meaningful when this block's preceding tag is the page's prolog
    /// sentinel, in which case the page starts one word before the header.
    ///
    /// # Safety
    ///
    /// `self.prev_tag()` must be [`Tag::Sentinel`].
    pub(crate) unsafe fn page_base(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.payload.as_ptr().sub(OVERHEAD)) }
    }
}

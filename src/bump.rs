//! Bump allocation of allocator bookkeeping.
//!
//! Every table the page allocator needs is carved out of one contiguous
//! window, from the top down. The same arithmetic is used to measure the
//! footprint of a memory map ahead of time, so a window of exactly that size
//! is always sufficient.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(1)       |
//!
//! Bookkeeping is never deallocated individually.

use core::{alloc::Layout, fmt, ptr::NonNull};

#[allow(unused_imports)]
use sptr::Strict;

/// An address aligned to every bookkeeping type, used as the notional top
/// of the window when measuring.
const MEASURE_TOP: usize = 1 << (usize::BITS - 2);

/// Returns the low mark after taking `layout` below `low_mark`.
#[inline]
fn bump_down(low_mark: usize, layout: Layout) -> Option<usize> {
    let unaligned = low_mark.checked_sub(layout.size())?;
    Some(unaligned & !(layout.align() - 1))
}

/// Returns the number of bytes needed to bump-allocate every layout in
/// `layouts`, in order, below an address aligned to at least the largest of
/// their alignments.
pub(crate) fn footprint<I>(layouts: I) -> Option<usize>
where
    I: IntoIterator<Item = Layout>,
{
    let mut low_mark = MEASURE_TOP;
    for layout in layouts {
        debug_assert!(layout.align() <= crate::PAGE_SIZE);
        low_mark = bump_down(low_mark, layout)?;
    }

    Some(MEASURE_TOP - low_mark)
}

/// A downward-growing bump allocator over a mapped window.
pub(crate) struct Bump {
    base: NonNull<u8>,
    limit: usize,
    low_mark: usize,
}

impl Bump {
    /// Constructs a new `Bump` over `len` bytes at `base`.
    ///
    /// Returns `None` if the window wraps around the address space.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes, and nothing
    /// else may access that memory while allocations from the `Bump` are in
    /// use.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Option<Bump> {
        let limit = base.as_ptr().addr().checked_add(len)?;

        Some(Bump {
            base,
            limit,
            low_mark: limit,
        })
    }

    /// Allocates a block of memory according to `layout`.
    ///
    /// The block is not initialized.
    pub fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let new_low_mark = bump_down(self.low_mark, layout)?;
        if new_low_mark < self.base.as_ptr().addr() {
            return None;
        }

        self.low_mark = new_low_mark;

        NonNull::new(self.base.as_ptr().with_addr(new_low_mark))
    }

    /// Allocates uninitialized storage for `len` values of `T`.
    pub fn allocate_array<T>(&mut self, len: usize) -> Option<NonNull<T>> {
        let layout = Layout::array::<T>(len).ok()?;
        self.allocate(layout).map(NonNull::cast)
    }

    /// Returns the number of bytes handed out so far, including alignment
    /// padding.
    #[inline]
    pub fn used(&self) -> usize {
        self.limit - self.low_mark
    }
}

impl fmt::Debug for Bump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bump")
            .field("base", &self.base)
            .field("limit", &self.limit)
            .field("low_mark", &self.low_mark)
            .finish()
    }
}

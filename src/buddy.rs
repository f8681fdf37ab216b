//! The per-region binary-buddy engine.
//!
//! A region manages a buddy universe of `2^(nr_orders - 1)` pages. Free
//! blocks are kept in one doubly linked list per order, threaded through the
//! page descriptors of each block's first page. A single bitmap holds one bit
//! per pair of sibling blocks at every order below the top; the bit is set
//! iff exactly one of the two siblings is entirely free. Toggling that bit is
//! enough to decide, in O(1) per order, whether an allocation has to split a
//! larger block and whether a free can coalesce with its buddy.

use core::{cmp, ptr::NonNull, slice};

use spin::{Mutex, MutexGuard};

use crate::{
    bitmap::Bitmap,
    page::{PageDesc, NIL},
    Owner, PageAttr, PageState, PhysAddr, PAGE_SHIFT, PAGE_SIZE,
};

/// Returns `floor(log2(x))`. `x` must be nonzero.
#[inline]
pub(crate) fn floor_log2(x: usize) -> u32 {
    debug_assert!(x != 0);
    usize::BITS - 1 - x.leading_zeros()
}

/// Returns `ceil(log2(x))`, treating 0 like 1.
#[inline]
pub(crate) fn ceil_log2(x: usize) -> u32 {
    match x {
        0 | 1 => 0,
        x => floor_log2(x - 1) + 1,
    }
}

/// The head of the free list of one order.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FreeList {
    head: u32,
    len: usize,
}

impl FreeList {
    pub const EMPTY: FreeList = FreeList { head: NIL, len: 0 };

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

/// A window of physically homogeneous memory with its own buddy allocator.
///
/// The window `[begin, end)` is the physically backed part of the region.
/// The buddy universe `[base, base + size)` is the smallest naturally
/// aligned power-of-two superset of it; pages of the universe outside the
/// window are permanently marked as [`PageState::Hole`].
pub struct Region {
    attr: PageAttr,
    begin: PhysAddr,
    end: PhysAddr,
    base: PhysAddr,
    nr_orders: u32,
    inner: Mutex<RegionInner>,
}

impl Region {
    /// Creates a region whose buddy universe is entirely free.
    ///
    /// Holes are not carved here; see `RegionInner::carve`.
    pub(crate) fn new(
        attr: PageAttr,
        begin: PhysAddr,
        end: PhysAddr,
        base: PhysAddr,
        inner: RegionInner,
    ) -> Region {
        Region {
            attr: attr.region_attrs(),
            begin,
            end,
            base,
            nr_orders: inner.nr_orders,
            inner: Mutex::new(inner),
        }
    }

    /// Returns the attributes of the memory in this region.
    #[inline]
    pub fn attr(&self) -> PageAttr {
        self.attr
    }

    /// Returns the first physically backed address.
    #[inline]
    pub fn begin(&self) -> PhysAddr {
        self.begin
    }

    /// Returns the address one past the last physically backed byte.
    #[inline]
    pub fn end(&self) -> PhysAddr {
        self.end
    }

    /// Returns the base of the buddy universe.
    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Returns the size of the buddy universe in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        universe_size(self.nr_orders)
    }

    /// Returns the number of block orders; the largest block has order
    /// `nr_orders() - 1` and spans the whole universe.
    #[inline]
    pub fn nr_orders(&self) -> u32 {
        self.nr_orders
    }

    /// Returns the number of pages in the buddy universe.
    #[inline]
    pub fn nr_pages(&self) -> usize {
        1 << (self.nr_orders - 1)
    }

    /// Returns the number of bytes that are not holes or system memory.
    pub fn usable(&self) -> usize {
        self.inner.lock().usable
    }

    /// Returns the number of free bytes.
    pub fn free(&self) -> usize {
        self.inner.lock().free
    }

    /// Returns the number of free blocks of `order`.
    pub fn free_blocks(&self, order: u32) -> usize {
        match order < self.nr_orders {
            true => self.inner.lock().blocks()[order as usize].len(),
            false => 0,
        }
    }

    /// Returns the state and owner of the page containing `addr`.
    pub fn page(&self, addr: PhysAddr) -> Option<(PageState, Owner)> {
        if !(self.begin..self.end).contains(&addr) {
            return None;
        }

        let desc = self.inner.lock().pages()[self.page_index(addr)];
        Some((desc.state, desc.owner))
    }

    /// Returns `true` if `[start, end)` lies inside the backed window.
    #[inline]
    pub(crate) fn spans(&self, start: PhysAddr, end: PhysAddr) -> bool {
        self.begin <= start && end <= self.end && start < end
    }

    /// Returns the page index of `addr` within the buddy universe.
    #[inline]
    pub(crate) fn page_index(&self, addr: PhysAddr) -> usize {
        (addr - self.base) >> PAGE_SHIFT
    }

    /// Returns the physical address of page `index`.
    #[inline]
    pub(crate) fn page_addr(&self, index: usize) -> PhysAddr {
        self.base + (index << PAGE_SHIFT)
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, RegionInner> {
        self.inner.lock()
    }

    /// Checks the buddy structures and hole placement against the
    /// descriptor table.
    pub(crate) fn verify(&self) -> Result<(), &'static str> {
        let inner = self.inner.lock();
        inner.verify()?;

        let backed = self.page_index(self.begin)..self.page_index(self.end);
        for (i, desc) in inner.pages().iter().enumerate() {
            match (backed.contains(&i), desc.state == PageState::Hole) {
                (true, true) => return Err("backed page marked as a hole"),
                (false, false) => return Err("unbacked page not marked as a hole"),
                _ => (),
            }
        }

        Ok(())
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("attr", &self.attr)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("base", &self.base)
            .field("nr_orders", &self.nr_orders)
            .finish_non_exhaustive()
    }
}

/// The lock-protected state of a region.
pub(crate) struct RegionInner {
    nr_orders: u32,
    pages: NonNull<PageDesc>,
    blocks: NonNull<FreeList>,
    bitmap: Bitmap,
    /// Bytes not marked `Hole` or `System`.
    pub usable: usize,
    /// Bytes marked `Free`.
    pub free: usize,
}

// SAFETY: the descriptor table, free-list heads and bitmap words belong to
// this region alone; moving the region between threads moves that ownership.
unsafe impl Send for RegionInner {}

impl RegionInner {
    /// Returns the number of bitmap bits for a universe of `nr_pages` pages.
    #[inline]
    pub const fn bitmap_bits(nr_pages: usize) -> usize {
        nr_pages - 1
    }

    /// Initializes region state over caller-provided storage and seeds the
    /// top-order free list with the whole universe.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `pages` must be valid for reads and writes of `2^(nr_orders - 1)`
    ///   `PageDesc` values.
    /// - `blocks` must be valid for reads and writes of `nr_orders`
    ///   `FreeList` values.
    /// - `bitmap` must be valid for reads and writes of
    ///   `Bitmap::num_blocks(bitmap_bits(2^(nr_orders - 1)))` words.
    /// - All three must be properly aligned and must not be used by anything
    ///   else for as long as the returned value exists.
    pub unsafe fn new(
        nr_orders: u32,
        pages: NonNull<PageDesc>,
        blocks: NonNull<FreeList>,
        bitmap: NonNull<u64>,
    ) -> RegionInner {
        assert!(nr_orders > 0 && nr_orders <= 32, "unsupported region order count");

        let nr_pages = 1_usize << (nr_orders - 1);

        for i in 0..nr_pages {
            unsafe { pages.as_ptr().add(i).write(PageDesc::FREE) };
        }

        for o in 0..nr_orders as usize {
            unsafe { blocks.as_ptr().add(o).write(FreeList::EMPTY) };
        }

        let bitmap = unsafe { Bitmap::new(Self::bitmap_bits(nr_pages), bitmap) };

        let mut inner = RegionInner {
            nr_orders,
            pages,
            blocks,
            bitmap,
            usable: nr_pages << PAGE_SHIFT,
            free: nr_pages << PAGE_SHIFT,
        };

        inner.list_push(nr_orders - 1, 0);
        inner
    }

    #[inline]
    pub fn nr_pages(&self) -> usize {
        1 << (self.nr_orders - 1)
    }

    #[inline]
    fn top(&self) -> u32 {
        self.nr_orders - 1
    }

    #[inline]
    pub fn pages(&self) -> &[PageDesc] {
        // SAFETY: see `RegionInner::new`.
        unsafe { slice::from_raw_parts(self.pages.as_ptr(), self.nr_pages()) }
    }

    #[inline]
    fn pages_mut(&mut self) -> &mut [PageDesc] {
        // SAFETY: see `RegionInner::new`.
        unsafe { slice::from_raw_parts_mut(self.pages.as_ptr(), self.nr_pages()) }
    }

    #[inline]
    pub fn blocks(&self) -> &[FreeList] {
        // SAFETY: see `RegionInner::new`.
        unsafe { slice::from_raw_parts(self.blocks.as_ptr(), self.nr_orders as usize) }
    }

    #[inline]
    fn blocks_mut(&mut self) -> &mut [FreeList] {
        // SAFETY: see `RegionInner::new`.
        unsafe { slice::from_raw_parts_mut(self.blocks.as_ptr(), self.nr_orders as usize) }
    }

    /// Returns the largest order a block starting at `page` can have.
    #[inline]
    pub fn page_to_max_order(&self, page: usize) -> u32 {
        match page {
            0 => self.top(),
            p => cmp::min(p.trailing_zeros(), self.top()),
        }
    }

    /// Returns the bitmap index of the sibling pair at `order` that contains
    /// `page`.
    ///
    /// Pairs of order 0 come first, followed by those of order 1, and so on;
    /// order `o` starts at bit `nr_pages - (nr_pages >> o)`.
    #[inline]
    fn bit(&self, order: u32, page: usize) -> usize {
        debug_assert!(order < self.top());

        let nr_pages = self.nr_pages();
        nr_pages - (nr_pages >> order) + (page >> (order + 1))
    }

    /// Pushes the block at `page` onto the free list of `order`.
    fn list_push(&mut self, order: u32, page: usize) {
        let head = self.blocks()[order as usize].head;
        if head != NIL {
            self.pages_mut()[head as usize].prev = page as u32;
        }

        let desc = &mut self.pages_mut()[page];
        desc.prev = NIL;
        desc.next = head;

        let list = &mut self.blocks_mut()[order as usize];
        list.head = page as u32;
        list.len += 1;
    }

    /// Removes the block at `page` from the free list of `order`.
    ///
    /// The block must be an element of that list.
    fn list_remove(&mut self, order: u32, page: usize) {
        let PageDesc { prev, next, .. } = self.pages()[page];

        match prev {
            // If there's no previous block, then `page` is the head of the
            // free list.
            NIL => {
                debug_assert_eq!(self.blocks()[order as usize].head, page as u32);
                self.blocks_mut()[order as usize].head = next;
            }
            p => self.pages_mut()[p as usize].next = next,
        }

        if next != NIL {
            self.pages_mut()[next as usize].prev = prev;
        }

        let desc = &mut self.pages_mut()[page];
        desc.prev = NIL;
        desc.next = NIL;

        self.blocks_mut()[order as usize].len -= 1;
    }

    /// Takes the block of `order` starting at `page` out of the free pool.
    ///
    /// The maximal free block containing `page` must have an order of at
    /// least `order`, and `page` must be aligned to `order`.
    pub fn block_alloc(&mut self, page: usize, order: u32) {
        debug_assert!(order <= self.top());
        debug_assert_eq!(page & ((1 << order) - 1), 0);

        // Ascend to the order of the free block holding `page`. Every pair
        // below it goes from "both free" to "one free"; the pair at its own
        // order goes from "one free" to "none free", which ends the ascent.
        let mut level = order;
        while level < self.top() && self.bitmap.toggle(self.bit(level, page)) {
            level += 1;
        }

        // Split on the way back down, keeping the half that holds `page`.
        while level > order {
            let parent = page & !((1 << level) - 1);
            self.list_remove(level, parent);

            level -= 1;
            self.list_push(level, parent + (1 << level));
            self.list_push(level, parent);
        }

        self.list_remove(order, page);
    }

    /// Returns the block of `order` starting at `page` to the free pool,
    /// coalescing it with free buddies.
    ///
    /// No page of the block may be linked into a free list.
    pub fn block_free(&mut self, page: usize, order: u32) {
        debug_assert!(order <= self.top());
        debug_assert_eq!(page & ((1 << order) - 1), 0);

        let mut block = page;
        let mut level = order;

        // A bit that toggles to 0 means the buddy was the free half of the
        // pair; both are free now and merge into their parent.
        while level < self.top() && !self.bitmap.toggle(self.bit(level, block)) {
            let buddy = block ^ (1 << level);
            self.list_remove(level, buddy);

            block &= !(1 << level);
            level += 1;
        }

        self.list_push(level, block);
    }

    /// Marks `count` free pages starting at `first` with `state` and `owner`
    /// and updates the byte counters.
    fn stamp(&mut self, first: usize, count: usize, state: PageState, owner: Owner) {
        for desc in &mut self.pages_mut()[first..first + count] {
            debug_assert_eq!(desc.state, PageState::Free);
            desc.state = state;
            desc.owner = owner;
        }

        self.free -= count << PAGE_SHIFT;
        if !state.is_usable() {
            self.usable -= count << PAGE_SHIFT;
        }
    }

    /// Returns the first page of the smallest free block of at least
    /// `order`.
    fn find_free(&self, order: u32) -> Option<usize> {
        self.blocks()
            .get(order as usize..)?
            .iter()
            .find(|list| list.head != NIL)
            .map(|list| list.head as usize)
    }

    /// Allocates a block of `order` and marks it with `state` and `owner`.
    ///
    /// Returns the first page of the block.
    pub fn alloc(&mut self, order: u32, state: PageState, owner: Owner) -> Option<usize> {
        let page = self.find_free(order)?;

        self.block_alloc(page, order);
        self.stamp(page, 1 << order, state, owner);

        Some(page)
    }

    /// Takes `count` pages starting at `first` out of the free pool in
    /// maximal aligned blocks.
    ///
    /// Every page in the range must be free.
    pub fn carve(&mut self, first: usize, count: usize, state: PageState, owner: Owner) {
        self.for_each_block(first, count, |inner, page, order| {
            inner.block_alloc(page, order);
            inner.stamp(page, 1 << order, state, owner);
        });
    }

    /// Returns `count` allocated pages starting at `first` to the free pool.
    ///
    /// The range is decomposed into maximal aligned blocks, each of which may
    /// coalesce with free memory outside the range.
    pub fn release(&mut self, first: usize, count: usize) {
        self.for_each_block(first, count, |inner, page, order| {
            for desc in &mut inner.pages_mut()[page..page + (1 << order)] {
                debug_assert!(desc.state.is_allocated());
                desc.state = PageState::Free;
                desc.owner = Owner::NONE;
            }

            inner.block_free(page, order);
        });

        self.free += count << PAGE_SHIFT;
    }

    fn for_each_block(
        &mut self,
        first: usize,
        count: usize,
        mut f: impl FnMut(&mut RegionInner, usize, u32),
    ) {
        let mut page = first;
        let mut left = count;

        while left > 0 {
            let order = cmp::min(self.page_to_max_order(page), floor_log2(left));
            f(self, page, order);

            page += 1 << order;
            left -= 1 << order;
        }
    }

    /// Reserves `count` pages starting at `first`, one page at a time.
    ///
    /// Fails without changing anything if a page in the range is not free,
    /// unless `realloc` is set and that page already has exactly `state` and
    /// `owner`.
    pub fn reserve(
        &mut self,
        first: usize,
        count: usize,
        state: PageState,
        owner: Owner,
        realloc: bool,
    ) -> bool {
        let available = self.pages()[first..first + count].iter().all(|desc| {
            desc.state == PageState::Free
                || (realloc && desc.state == state && desc.owner == owner)
        });

        if !available {
            return false;
        }

        for page in first..first + count {
            if self.pages()[page].state == PageState::Free {
                self.block_alloc(page, 0);
                self.stamp(page, 1, state, owner);
            }
        }

        true
    }

    /// Returns `true` if every page in the range is allocated to `owner`.
    pub fn owned_by(&self, first: usize, count: usize, owner: Owner) -> bool {
        self.pages()[first..first + count]
            .iter()
            .all(|desc| desc.state.is_allocated() && desc.owner == owner)
    }

    /// Returns `true` if the block of `order` at `page` is entirely free.
    fn is_free_block(&self, page: usize, order: u32) -> bool {
        self.pages()[page..page + (1 << order)]
            .iter()
            .all(|desc| desc.state == PageState::Free)
    }

    /// Returns `true` if the block of `order` at `page` is free and its
    /// parent is not.
    fn is_maximal_free_block(&self, page: usize, order: u32) -> bool {
        self.is_free_block(page, order)
            && (order == self.top() || !self.is_free_block(page & !(1 << order), order + 1))
    }

    /// Checks every structural invariant against the descriptor table.
    ///
    /// This walks the whole table once per order.
    pub fn verify(&self) -> Result<(), &'static str> {
        let nr_pages = self.nr_pages();

        let free = self
            .pages()
            .iter()
            .filter(|d| d.state == PageState::Free)
            .count();
        if free << PAGE_SHIFT != self.free {
            return Err("free byte count does not match descriptors");
        }

        let usable = self.pages().iter().filter(|d| d.state.is_usable()).count();
        if usable << PAGE_SHIFT != self.usable {
            return Err("usable byte count does not match descriptors");
        }

        for order in 0..self.nr_orders {
            let list = self.blocks()[order as usize];

            // Walk the list, bounded by the number of blocks of this order.
            let mut seen = 0;
            let mut prev = NIL;
            let mut cur = list.head;
            while cur != NIL {
                let page = cur as usize;
                if page >= nr_pages || seen >= nr_pages >> order {
                    return Err("free list is corrupt");
                }
                if self.page_to_max_order(page) < order {
                    return Err("free block is misaligned for its order");
                }
                if !self.is_maximal_free_block(page, order) {
                    return Err("free list holds a block that is not maximal");
                }
                if self.pages()[page].prev != prev {
                    return Err("free list back link is corrupt");
                }

                seen += 1;
                prev = cur;
                cur = self.pages()[page].next;
            }

            if seen != list.len {
                return Err("free list length is wrong");
            }

            let maximal = (0..nr_pages)
                .step_by(1 << order)
                .filter(|&page| self.is_maximal_free_block(page, order))
                .count();
            if maximal != seen {
                return Err("maximal free block missing from its free list");
            }

            if order < self.top() {
                for pair in (0..nr_pages).step_by(2 << order) {
                    let expect = self.is_free_block(pair, order)
                        != self.is_free_block(pair + (1 << order), order);
                    if self.bitmap.get(self.bit(order, pair)) != expect {
                        return Err("buddy bitmap disagrees with descriptors");
                    }
                }
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Snapshot {
        use alloc::vec::Vec;

        let lists = (0..self.nr_orders)
            .map(|order| {
                let mut heads = Vec::new();
                let mut cur = self.blocks()[order as usize].head;
                while cur != NIL {
                    heads.push(cur);
                    cur = self.pages()[cur as usize].next;
                }
                heads.sort_unstable();
                heads
            })
            .collect();

        Snapshot {
            lists,
            bitmap: self.bitmap.to_vec(),
            free: self.free,
            usable: self.usable,
        }
    }
}

/// The free-pool state of a region, for comparing before and after.
#[cfg(test)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub lists: alloc::vec::Vec<alloc::vec::Vec<u32>>,
    pub bitmap: alloc::vec::Vec<u64>,
    pub free: usize,
    pub usable: usize,
}

/// The number of bytes a region of `nr_orders` orders spans.
#[inline]
pub(crate) const fn universe_size(nr_orders: u32) -> usize {
    PAGE_SIZE << (nr_orders - 1)
}

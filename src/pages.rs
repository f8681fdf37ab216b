//! The region directory and the page allocation API.

use core::{alloc::Layout, cmp, fmt, ptr::NonNull, slice};

use crate::{
    boot::{self, BootArgs, Directory, MemDesc, PhysMapper, Survey},
    buddy::{ceil_log2, Region},
    bump::Bump,
    dump::Dump,
    page_align_down, page_align_up, BackingAllocator, Corruption, InitError, Owner, PageAttr,
    PageError, PageState, PhysAddr, Raw, PAGE_SHIFT, PAGE_SIZE,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Attribute masks tried in turn when matching a request against regions.
///
/// DMA capability is given up first, then cache coherency. Persistence is
/// never given up.
const FALLBACK_MASKS: [PageAttr; 3] = [
    PageAttr::DMA.union(PageAttr::COHERENT).union(PageAttr::PERSISTENT),
    PageAttr::COHERENT.union(PageAttr::PERSISTENT),
    PageAttr::PERSISTENT,
];

/// Returns the page-aligned span covering `[addr, addr + len)`.
fn page_span(addr: PhysAddr, len: usize) -> Option<(PhysAddr, PhysAddr)> {
    let end = page_align_up(addr.checked_add(len)?)?;
    Some((page_align_down(addr), end))
}

/// Returns the state recorded for pages allocated with `attr`.
fn alloc_state(attr: PageAttr) -> PageState {
    match attr.contains(PageAttr::MAPPED) {
        true => PageState::Mapped,
        false => PageState::Fixed,
    }
}

/// Returns the size in bytes of the bump arena for `survey`.
fn arena_layout(survey: &Survey) -> Result<Layout, InitError> {
    let size = page_align_up(survey.footprint).ok_or(InitError::InvalidConfig)?;
    Layout::from_size_align(size, PAGE_SIZE).map_err(|_| InitError::InvalidConfig)
}

/// A physical page allocator over every region of a memory map.
///
/// All methods take `&self`; each region serializes access to its own
/// bookkeeping, and no operation holds more than one region lock at a time.
pub struct PageAllocator<A: BackingAllocator> {
    dir: Directory,
    metadata: NonNull<u8>,
    layout: Layout,
    backing_allocator: A,
}

// SAFETY: the directory is immutable after construction and every region
// guards its mutable state with its own lock.
unsafe impl<A: BackingAllocator + Send> Send for PageAllocator<A> {}
unsafe impl<A: BackingAllocator + Sync> Sync for PageAllocator<A> {}

impl PageAllocator<Raw> {
    /// Builds the allocator with its bookkeeping placed inside the managed
    /// memory.
    ///
    /// A window of normal-speed memory clear of every range in `boot` is
    /// mapped through `mapper`, the region directory is carved from its top,
    /// and the pages consumed are reserved as [`PageState::System`] owned by
    /// [`Owner::ALLOCATOR`]. The ranges in `boot` are then reserved as
    /// system memory owned by [`Owner::KERNEL`]; a range that cannot be
    /// reserved is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if `mem` is malformed, if no window can hold the
    /// bookkeeping, or if the window cannot be reserved afterwards.
    ///
    /// # Safety
    ///
    /// `mem` and `boot` must describe the machine: every byte the kernel uses
    /// at this point must lie outside `mem` or inside a range of `boot`.
    /// Memory the allocator hands out must not be in use.
    pub unsafe fn bootstrap<M>(
        mem: &[MemDesc],
        boot: &BootArgs<'_>,
        mapper: &M,
    ) -> Result<PageAllocator<Raw>, InitError>
    where
        M: PhysMapper + ?Sized,
    {
        let survey = boot::survey(mem)?;
        let layout = arena_layout(&survey)?;

        let (lo, hi) =
            boot::scratch_window(mem, boot, layout.size()).ok_or(InitError::NoMemory)?;
        let window = mapper.map(lo, layout.size()).ok_or(InitError::NoMemory)?;

        // SAFETY: the window is unused memory by the contract of this
        // function, and `mapper` guarantees the pointer covers it.
        let mut bump = unsafe { Bump::new(window, layout.size()) }.ok_or(InitError::InvalidConfig)?;
        let dir = boot::build(mem, &survey, &mut bump)?;

        let pages = PageAllocator {
            dir,
            metadata: window,
            layout,
            backing_allocator: Raw,
        };

        let used = page_align_down(hi - bump.used());
        if !pages.reserve_system(used, hi, Owner::ALLOCATOR, false) {
            return Err(InitError::Reserve {
                addr: used,
                len: hi - used,
            });
        }
        log::debug!("reserved {:#x}..{:#x} for page allocator bookkeeping", used, hi);

        pages.reserve_boot(boot);

        Ok(pages)
    }
}

#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
impl PageAllocator<Global> {
    /// Returns the layout of the bookkeeping needed for `mem`.
    ///
    /// # Errors
    ///
    /// Returns an error if `mem` is malformed.
    pub fn metadata_layout(mem: &[MemDesc]) -> Result<Layout, InitError> {
        arena_layout(&boot::survey(mem)?)
    }

    /// Builds the allocator with its bookkeeping on the global heap.
    ///
    /// Nothing inside the managed memory is used for bookkeeping. The ranges
    /// in `boot` are reserved as in [`PageAllocator::bootstrap`].
    ///
    /// # Errors
    ///
    /// Returns an error if `mem` is malformed or empty, or if the bookkeeping
    /// could not be allocated.
    pub fn try_new(mem: &[MemDesc], boot: &BootArgs<'_>) -> Result<PageAllocator<Global>, InitError> {
        let survey = boot::survey(mem)?;
        let layout = arena_layout(&survey)?;

        if layout.size() == 0 {
            return Err(InitError::InvalidConfig);
        }

        unsafe {
            let metadata = NonNull::new(alloc::alloc::alloc_zeroed(layout))
                .ok_or(InitError::AllocFailed(layout))?;

            let dir = match Bump::new(metadata, layout.size())
                .ok_or(InitError::InvalidConfig)
                .and_then(|mut bump| boot::build(mem, &survey, &mut bump))
            {
                Ok(d) => d,
                Err(e) => {
                    alloc::alloc::dealloc(metadata.as_ptr(), layout);
                    return Err(e);
                }
            };

            let pages = PageAllocator {
                dir,
                metadata,
                layout,
                backing_allocator: Global,
            };
            pages.reserve_boot(boot);

            Ok(pages)
        }
    }
}

impl<A> PageAllocator<A>
where
    A: BackingAllocator,
{
    /// Returns every region, in ascending address order.
    pub fn regions(&self) -> &[Region] {
        // SAFETY: the directory holds `count` initialized regions that live
        // as long as `self`.
        unsafe { slice::from_raw_parts(self.dir.regions.as_ptr(), self.dir.count) }
    }

    /// Returns region indices sorted by speed class, slowest first.
    fn by_speed(&self) -> &[usize] {
        // SAFETY: as in `regions`.
        unsafe { slice::from_raw_parts(self.dir.by_speed.as_ptr(), self.dir.count) }
    }

    /// Returns the region whose backed window contains `[start, end)`.
    fn region_for(&self, start: PhysAddr, end: PhysAddr) -> Option<&Region> {
        self.regions().iter().find(|r| r.spans(start, end))
    }

    /// Runs `f` on the first region that satisfies it, in fallback order.
    ///
    /// Regions of the requested speed class are tried first under each
    /// attribute mask. Then, unless the request forbids it, every region is
    /// tried under each mask, slowest first.
    fn search<T, F>(&self, order: u32, attr: PageAttr, mut f: F) -> Option<T>
    where
        F: FnMut(&Region, &mut crate::buddy::RegionInner) -> Option<T>,
    {
        let mut attempt = |region: &Region, mask: PageAttr| -> Option<T> {
            if order >= region.nr_orders() || region.attr() & mask != attr & mask {
                return None;
            }

            f(region, &mut *region.lock())
        };

        let speed = attr.speed();
        for (pass, &mask) in FALLBACK_MASKS.iter().enumerate() {
            for region in self.regions().iter().filter(|r| r.attr().speed() == speed) {
                if let Some(found) = attempt(region, mask) {
                    if pass > 0 {
                        log::trace!("order {} [{}] served by {} under {:?}", order, attr, region.attr(), mask);
                    }
                    return Some(found);
                }
            }
        }

        if attr.contains(PageAttr::NO_SPEED_FALLBACK) {
            return None;
        }

        for &mask in FALLBACK_MASKS.iter() {
            for &idx in self.by_speed() {
                let region = &self.regions()[idx];
                if let Some(found) = attempt(region, mask) {
                    log::trace!("order {} [{}] served by {} under {:?}", order, attr, region.attr(), mask);
                    return Some(found);
                }
            }
        }

        None
    }

    /// Allocates a naturally aligned block of `2^order` pages.
    ///
    /// The pages are recorded as [`PageState::Mapped`] if `attr` contains
    /// [`PageAttr::MAPPED`] and as [`PageState::Fixed`] otherwise, owned by
    /// `owner`. Returns the physical address of the block, or `None` if no
    /// region at any fallback level has a free block of that order.
    pub fn alloc_order(&self, order: u32, attr: PageAttr, owner: Owner) -> Option<PhysAddr> {
        let state = alloc_state(attr);

        self.search(order, attr, |region, inner| {
            let page = inner.alloc(order, state, owner)?;
            Some(region.page_addr(page))
        })
    }

    /// Allocates `len` bytes, rounded up to whole pages.
    ///
    /// A block of the next power-of-two size is allocated and the pages past
    /// `len` are freed again before the region is unlocked. Returns `None` if
    /// `len` is zero or no region can satisfy the request.
    pub fn alloc(&self, len: usize, attr: PageAttr, owner: Owner) -> Option<PhysAddr> {
        if len == 0 {
            return None;
        }

        let pages = page_align_up(len)? >> PAGE_SHIFT;
        let order = ceil_log2(pages);
        let state = alloc_state(attr);

        self.search(order, attr, |region, inner| {
            let page = inner.alloc(order, state, owner)?;

            let excess = (1 << order) - pages;
            if excess > 0 {
                inner.release(page + pages, excess);
            }

            Some(region.page_addr(page))
        })
    }

    /// Reserves the pages covering `[addr, addr + len)` for `owner`.
    ///
    /// The reservation is all or nothing: if any page is not free, nothing
    /// changes and `None` is returned. With [`PageAttr::REALLOC`], pages that
    /// already carry exactly the requested state and owner count as
    /// available. Returns the page-aligned start of the range.
    pub fn reserve(
        &self,
        addr: PhysAddr,
        len: usize,
        attr: PageAttr,
        owner: Owner,
    ) -> Option<PhysAddr> {
        let (start, end) = page_span(addr, len)?;
        if len == 0 {
            return Some(start);
        }

        let region = self.region_for(start, end)?;
        let first = region.page_index(start);
        let count = (end - start) >> PAGE_SHIFT;

        region
            .lock()
            .reserve(first, count, alloc_state(attr), owner, attr.contains(PageAttr::REALLOC))
            .then(|| start)
    }

    /// Reserves `[start, end)` as system memory. The range must be page
    /// aligned and inside one region.
    fn reserve_system(&self, start: PhysAddr, end: PhysAddr, owner: Owner, realloc: bool) -> bool {
        let region = match self.region_for(start, end) {
            Some(r) => r,
            None => return false,
        };

        let first = region.page_index(start);
        let count = (end - start) >> PAGE_SHIFT;
        region.lock().reserve(first, count, PageState::System, owner, realloc)
    }

    /// Reserves every range of `boot`, clipped to each region, as system
    /// memory owned by the kernel.
    fn reserve_boot(&self, boot: &BootArgs<'_>) {
        for (rs, re) in boot.reserved().filter_map(|r| r.page_span()) {
            for region in self.regions() {
                let start = cmp::max(rs, region.begin());
                let end = cmp::min(re, region.end());
                if start >= end {
                    continue;
                }

                if self.reserve_system(start, end, Owner::KERNEL, true) {
                    log::debug!("reserved {:#x}..{:#x} for the kernel", start, end);
                } else {
                    log::warn!("cannot reserve {:#x}..{:#x} for the kernel", start, end);
                }
            }
        }
    }

    /// Frees the pages covering `[addr, addr + len)`.
    ///
    /// Every page must be allocated ([`PageState::Fixed`] or
    /// [`PageState::Mapped`]) to `owner`. The range need not match a single
    /// earlier allocation; it is returned in maximal aligned blocks, which
    /// coalesce with free neighbours.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Fault`] if the range does not lie inside a
    /// single region, and [`PageError::Invalid`] if a page in it is not
    /// allocated to `owner`. Nothing changes on error.
    pub fn free(&self, addr: PhysAddr, len: usize, owner: Owner) -> Result<(), PageError> {
        if len == 0 {
            return Ok(());
        }

        let (start, end) = page_span(addr, len).ok_or(PageError::Fault)?;
        let region = self.region_for(start, end).ok_or(PageError::Fault)?;
        let first = region.page_index(start);
        let count = (end - start) >> PAGE_SHIFT;

        let mut inner = region.lock();
        if !inner.owned_by(first, count, owner) {
            return Err(PageError::Invalid);
        }

        inner.release(first, count);
        Ok(())
    }

    /// Returns `true` if every page covering `[addr, addr + len)` is held by
    /// `owner`, either as an allocation or as system memory.
    ///
    /// The answer may be stale by the time the caller acts on it if another
    /// thread frees or allocates the same pages concurrently.
    pub fn valid(&self, addr: PhysAddr, len: usize, owner: Owner) -> bool {
        if len == 0 {
            return true;
        }

        let (start, end) = match page_span(addr, len) {
            Some(span) => span,
            None => return false,
        };
        let region = match self.region_for(start, end) {
            Some(r) => r,
            None => return false,
        };

        let first = region.page_index(start);
        let count = (end - start) >> PAGE_SHIFT;

        region.lock().pages()[first..first + count].iter().all(|desc| {
            matches!(desc.state, PageState::Fixed | PageState::Mapped | PageState::System)
                && desc.owner == owner
        })
    }

    /// Returns the attributes of the region holding `[addr, addr + len)`.
    ///
    /// A zero `len` looks up the page containing `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Invalid`] if the range does not lie inside a
    /// single region.
    pub fn attr_of(&self, addr: PhysAddr, len: usize) -> Result<PageAttr, PageError> {
        let (start, end) = page_span(addr, cmp::max(len, 1)).ok_or(PageError::Invalid)?;

        self.region_for(start, end)
            .map(Region::attr)
            .ok_or(PageError::Invalid)
    }

    /// Returns a diagnostic view of every region.
    ///
    /// See [`Dump`] for the format.
    pub fn dump(&self) -> Dump<'_> {
        Dump::new(self.regions())
    }

    /// Checks every structural invariant of every region.
    ///
    /// This walks each descriptor table once per block order and is meant for
    /// tests and debugging.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn verify(&self) -> Result<(), Corruption> {
        let mut prev: Option<&Region> = None;

        for region in self.regions() {
            let corrupt = |what| Corruption {
                region: region.begin(),
                what,
            };

            if let Some(p) = prev {
                if p.end() > region.begin() {
                    return Err(corrupt("region overlaps its predecessor"));
                }
            }

            if region.size() != region.nr_pages() << PAGE_SHIFT
                || region.base() & (region.size() - 1) != 0
                || region.begin() < region.base()
                || region.end() - region.base() > region.size()
            {
                return Err(corrupt("region bounds are inconsistent"));
            }

            region.verify().map_err(corrupt)?;
            prev = Some(region);
        }

        Ok(())
    }
}

impl<A> Drop for PageAllocator<A>
where
    A: BackingAllocator,
{
    fn drop(&mut self) {
        // Regions hold no resources outside the bookkeeping block.
        unsafe {
            self.backing_allocator
                .deallocate(self.metadata, self.layout)
        };
    }
}

impl<A> fmt::Debug for PageAllocator<A>
where
    A: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("regions", &self.regions())
            .field("metadata", &self.metadata)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::{boot::test_memory::HostMemory, PhysRange};

    const MIB: usize = 1 << 20;
    const NORMAL_BASE: PhysAddr = 0x8000_0000;
    const FAST_BASE: PhysAddr = 0x9000_0000;

    const A: Owner = Owner(0xA000);
    const B: Owner = Owner(0xB000);

    fn desc(base: PhysAddr, size: usize, attr: PageAttr) -> MemDesc {
        MemDesc { base, size, attr }
    }

    fn heap(mem: &[MemDesc]) -> PageAllocator<Global> {
        let pages = PageAllocator::try_new(mem, &BootArgs::default()).unwrap();
        pages.verify().unwrap();
        pages
    }

    fn one_region() -> PageAllocator<Global> {
        heap(&[desc(NORMAL_BASE, MIB, PageAttr::NORMAL)])
    }

    fn two_speeds() -> PageAllocator<Global> {
        heap(&[
            desc(FAST_BASE, MIB, PageAttr::FAST),
            desc(NORMAL_BASE, MIB, PageAttr::NORMAL),
        ])
    }

    #[test]
    fn single_page_round_trip() {
        let pages = one_region();
        let before = pages.regions()[0].lock().snapshot();

        let addr = pages.alloc(PAGE_SIZE, PageAttr::NORMAL, A).unwrap();
        assert_eq!(addr, NORMAL_BASE);
        pages.verify().unwrap();

        pages.free(addr, PAGE_SIZE, A).unwrap();
        pages.verify().unwrap();

        let region = &pages.regions()[0];
        assert_eq!(region.free_blocks(region.nr_orders() - 1), 1);
        let after = region.lock().snapshot();
        assert!(after.bitmap.iter().all(|&w| w == 0));
        assert_eq!(after, before);
    }

    #[test]
    fn sequential_pages_ascend_and_coalesce() {
        let pages = one_region();
        let owner = |i: usize| Owner(0x1_0000 + i);

        for i in 0..32 {
            let addr = pages.alloc(PAGE_SIZE, PageAttr::NORMAL, owner(i)).unwrap();
            assert_eq!(addr, NORMAL_BASE + i * PAGE_SIZE);
        }
        pages.verify().unwrap();

        // 7 is coprime with 32, so this visits every page once.
        for i in (0..32).map(|i| (i * 7) % 32) {
            pages.free(NORMAL_BASE + i * PAGE_SIZE, PAGE_SIZE, owner(i)).unwrap();
            pages.verify().unwrap();
        }

        let region = &pages.regions()[0];
        assert_eq!(region.free_blocks(region.nr_orders() - 1), 1);
        assert_eq!(region.free(), MIB);
    }

    #[test]
    fn no_speed_fallback_fails_when_class_is_short() {
        let pages = two_speeds();

        let fast = pages.alloc(MIB / 2, PageAttr::FAST, A).unwrap();
        assert!((FAST_BASE..FAST_BASE + MIB).contains(&fast));

        let req = PageAttr::FAST | PageAttr::NO_SPEED_FALLBACK;
        assert_eq!(pages.alloc(MIB, req, B), None);
        assert_eq!(pages.alloc(2 * MIB, req, B), None);
        assert_eq!(pages.regions()[0].free(), MIB);
        pages.verify().unwrap();
    }

    #[test]
    fn speed_fallback_serves_from_other_class() {
        let pages = two_speeds();

        pages.alloc(MIB / 2, PageAttr::FAST, A).unwrap();
        let addr = pages.alloc(MIB, PageAttr::FAST, B).unwrap();

        assert_eq!(addr, NORMAL_BASE);
        assert_eq!(pages.regions()[0].free(), 0);
        pages.verify().unwrap();
    }

    #[test]
    fn archive_is_reserved_at_boot() {
        const BASE: PhysAddr = 0x4000_0000;

        let mem = [desc(BASE, MIB, PageAttr::NORMAL)];
        let archive = PhysRange::new(BASE + 0x800, 0x3000);

        let plain_host = HostMemory::new(BASE, MIB);
        let plain = unsafe { PageAllocator::bootstrap(&mem, &BootArgs::default(), &plain_host) }
            .unwrap();
        plain.verify().unwrap();

        let host = HostMemory::new(BASE, MIB);
        let boot = BootArgs {
            archive: Some(archive),
            ..BootArgs::default()
        };
        let pages = unsafe { PageAllocator::bootstrap(&mem, &boot, &host) }.unwrap();
        pages.verify().unwrap();

        let rounded = BASE..BASE + 0x4000;
        for addr in rounded.clone().step_by(PAGE_SIZE) {
            assert_eq!(
                pages.regions()[0].page(addr),
                Some((PageState::System, Owner::KERNEL))
            );
        }
        assert!(pages.valid(rounded.start, rounded.len(), Owner::KERNEL));
        assert_eq!(
            plain.regions()[0].usable() - pages.regions()[0].usable(),
            rounded.len()
        );

        // The bookkeeping sits at the top of the region.
        let top = BASE + MIB - PAGE_SIZE;
        assert_eq!(
            pages.regions()[0].page(top),
            Some((PageState::System, Owner::ALLOCATOR))
        );
        assert_eq!(pages.reserve(top, PAGE_SIZE, PageAttr::NORMAL, A), None);

        // Allocation skips both reservations.
        let addr = pages.alloc(PAGE_SIZE, PageAttr::NORMAL, A).unwrap();
        assert!(addr >= rounded.end && addr < top);
        pages.verify().unwrap();
    }

    #[test]
    fn bootstrap_needs_normal_memory() {
        let mem = [desc(0x4000_0000, MIB, PageAttr::FAST)];
        let host = HostMemory::new(0x4000_0000, MIB);

        let err = unsafe { PageAllocator::bootstrap(&mem, &BootArgs::default(), &host) }.unwrap_err();
        assert_eq!(err, InitError::NoMemory);
    }

    #[test]
    fn bootstrap_needs_a_mapping() {
        let mem = [desc(0x4000_0000, MIB, PageAttr::NORMAL)];
        let host = HostMemory::new(0x5000_0000, MIB);

        let err = unsafe { PageAllocator::bootstrap(&mem, &BootArgs::default(), &host) }.unwrap_err();
        assert_eq!(err, InitError::NoMemory);
    }

    #[test]
    fn partial_free_of_a_block() {
        let pages = one_region();

        let addr = pages.alloc_order(4, PageAttr::NORMAL, A).unwrap();
        assert_eq!(addr, NORMAL_BASE);

        pages.free(addr + 4 * PAGE_SIZE, 8 * PAGE_SIZE, A).unwrap();
        pages.verify().unwrap();

        let region = &pages.regions()[0];
        for i in (0..4).chain(12..16) {
            assert_eq!(region.page(addr + i * PAGE_SIZE), Some((PageState::Fixed, A)));
        }
        for i in 4..12 {
            assert_eq!(
                region.page(addr + i * PAGE_SIZE),
                Some((PageState::Free, Owner::NONE))
            );
        }
        assert_eq!(region.free_blocks(2), 2);
        assert_eq!(region.free_blocks(3), 0);
    }

    #[test]
    fn alloc_returns_the_excess() {
        let pages = one_region();

        let addr = pages.alloc(3 * PAGE_SIZE - 100, PageAttr::NORMAL, A).unwrap();
        let region = &pages.regions()[0];

        assert_eq!(region.free(), MIB - 3 * PAGE_SIZE);
        assert_eq!(region.page(addr + 3 * PAGE_SIZE), Some((PageState::Free, Owner::NONE)));
        assert!(pages.valid(addr, 3 * PAGE_SIZE, A));

        // The next allocation reuses the returned tail.
        let next = pages.alloc(PAGE_SIZE, PageAttr::NORMAL, B).unwrap();
        assert_eq!(next, addr + 3 * PAGE_SIZE);
        pages.verify().unwrap();
    }

    #[test]
    fn mapped_requests_record_mapped_pages() {
        let pages = one_region();

        let addr = pages
            .alloc_order(1, PageAttr::NORMAL | PageAttr::MAPPED, A)
            .unwrap();
        assert_eq!(pages.regions()[0].page(addr), Some((PageState::Mapped, A)));
        pages.free(addr, 2 * PAGE_SIZE, A).unwrap();
    }

    #[test]
    fn oversized_orders_fail_cleanly() {
        let pages = one_region();
        let before = pages.regions()[0].lock().snapshot();

        assert_eq!(pages.alloc_order(9, PageAttr::NORMAL, A), None);
        assert_eq!(pages.alloc_order(u32::MAX, PageAttr::NORMAL, A), None);
        assert_eq!(pages.alloc(usize::MAX, PageAttr::NORMAL, A), None);
        assert_eq!(pages.regions()[0].lock().snapshot(), before);

        let whole = pages.alloc_order(8, PageAttr::NORMAL, A).unwrap();
        assert_eq!(pages.alloc(PAGE_SIZE, PageAttr::NORMAL, A), None);
        pages.free(whole, MIB, A).unwrap();
        assert_eq!(pages.regions()[0].lock().snapshot(), before);
    }

    #[test]
    fn free_rejects_foreign_and_unknown_ranges() {
        let pages = two_speeds();
        let addr = pages.alloc_order(2, PageAttr::NORMAL, A).unwrap();
        let before = pages.regions()[0].lock().snapshot();

        assert_eq!(pages.free(addr, 4 * PAGE_SIZE, B), Err(PageError::Invalid));
        assert_eq!(pages.free(addr, 5 * PAGE_SIZE, A), Err(PageError::Invalid));
        assert_eq!(pages.free(0x1000, PAGE_SIZE, A), Err(PageError::Fault));
        assert_eq!(
            pages.free(NORMAL_BASE + MIB - PAGE_SIZE, 2 * PAGE_SIZE, A),
            Err(PageError::Fault)
        );
        assert_eq!(pages.free(usize::MAX - 10, 100, A), Err(PageError::Fault));
        assert_eq!(pages.regions()[0].lock().snapshot(), before);

        assert_eq!(PageError::Fault.errno(), -14);
        assert_eq!(PageError::Invalid.errno(), -22);
    }

    #[test]
    fn zero_length_requests() {
        let pages = one_region();
        let before = pages.regions()[0].lock().snapshot();

        assert_eq!(pages.alloc(0, PageAttr::NORMAL, A), None);
        assert_eq!(
            pages.reserve(NORMAL_BASE + 0x1234, 0, PageAttr::NORMAL, A),
            Some(NORMAL_BASE + 0x1000)
        );
        assert_eq!(pages.free(NORMAL_BASE, 0, A), Ok(()));
        assert!(pages.valid(0xdead_0000, 0, A));
        assert_eq!(pages.regions()[0].lock().snapshot(), before);
    }

    #[test]
    fn reserve_is_idempotent_with_realloc() {
        let pages = one_region();
        let addr = NORMAL_BASE + 0x1_0800;

        let start = pages.reserve(addr, 0x2000, PageAttr::NORMAL, A).unwrap();
        assert_eq!(start, NORMAL_BASE + 0x1_0000);
        let before = pages.regions()[0].lock().snapshot();

        assert_eq!(pages.reserve(addr, 0x2000, PageAttr::NORMAL, A), None);
        assert_eq!(
            pages.reserve(addr, 0x2000, PageAttr::NORMAL | PageAttr::REALLOC, A),
            Some(start)
        );
        assert_eq!(
            pages.reserve(addr, 0x2000, PageAttr::NORMAL | PageAttr::REALLOC, B),
            None
        );
        assert_eq!(pages.regions()[0].lock().snapshot(), before);

        assert!(pages.valid(start, 3 * PAGE_SIZE, A));
        pages.free(start, 3 * PAGE_SIZE, A).unwrap();
        pages.verify().unwrap();
    }

    #[test]
    fn reserve_outside_regions_fails() {
        let pages = one_region();

        assert_eq!(pages.reserve(0x1000, PAGE_SIZE, PageAttr::NORMAL, A), None);
        assert_eq!(
            pages.reserve(NORMAL_BASE + MIB - PAGE_SIZE, 2 * PAGE_SIZE, PageAttr::NORMAL, A),
            None
        );
        assert_eq!(pages.reserve(usize::MAX - 10, 100, PageAttr::NORMAL, A), None);
    }

    #[test]
    fn valid_checks_owner_and_state() {
        let pages = one_region();
        let addr = pages.alloc(2 * PAGE_SIZE, PageAttr::NORMAL, A).unwrap();

        assert!(pages.valid(addr, 2 * PAGE_SIZE, A));
        assert!(pages.valid(addr + 10, 5, A));
        assert!(!pages.valid(addr, 2 * PAGE_SIZE, B));
        assert!(!pages.valid(addr, 3 * PAGE_SIZE, A));
        assert!(!pages.valid(0x1000, PAGE_SIZE, A));
    }

    #[test]
    fn attr_of_reports_region_attributes() {
        let pages = two_speeds();

        assert_eq!(pages.attr_of(FAST_BASE + 0x10, 0x10), Ok(PageAttr::FAST));
        assert_eq!(pages.attr_of(NORMAL_BASE, 0), Ok(PageAttr::NORMAL));
        assert_eq!(pages.attr_of(0x1000, 1), Err(PageError::Invalid));
        assert_eq!(pages.attr_of(NORMAL_BASE + MIB - 1, 2), Err(PageError::Invalid));
    }

    #[test]
    fn exact_attributes_are_preferred() {
        let pages = heap(&[
            desc(NORMAL_BASE, MIB, PageAttr::NORMAL),
            desc(FAST_BASE, MIB, PageAttr::NORMAL | PageAttr::DMA),
        ]);

        let dma = pages.alloc(PAGE_SIZE, PageAttr::NORMAL | PageAttr::DMA, A).unwrap();
        assert_eq!(dma, FAST_BASE);

        let plain = pages.alloc(PAGE_SIZE, PageAttr::NORMAL, A).unwrap();
        assert_eq!(plain, NORMAL_BASE);
    }

    #[test]
    fn dma_and_coherency_degrade_but_persistence_does_not() {
        let pages = one_region();

        let req = PageAttr::NORMAL | PageAttr::DMA | PageAttr::COHERENT;
        assert_eq!(pages.alloc(PAGE_SIZE, req, A), Some(NORMAL_BASE));

        let req = PageAttr::NORMAL | PageAttr::PERSISTENT;
        assert_eq!(pages.alloc(PAGE_SIZE, req, A), None);
    }

    #[test]
    fn speed_fallback_prefers_slower_classes() {
        let pages = heap(&[
            desc(NORMAL_BASE, MIB, PageAttr::FASTEST),
            desc(FAST_BASE, MIB, PageAttr::SLOW),
        ]);

        assert_eq!(pages.alloc(PAGE_SIZE, PageAttr::NORMAL, A), Some(FAST_BASE));
        assert_eq!(
            pages.alloc(PAGE_SIZE, PageAttr::NORMAL | PageAttr::NO_SPEED_FALLBACK, A),
            None
        );
    }

    #[test]
    fn holes_are_never_allocated() {
        // A 12-page span lives in a 16-page universe.
        let pages = heap(&[desc(NORMAL_BASE, 12 * PAGE_SIZE, PageAttr::NORMAL)]);
        let region = &pages.regions()[0];

        assert_eq!(region.nr_pages(), 16);
        assert_eq!(region.usable(), 12 * PAGE_SIZE);
        assert_eq!(region.page(NORMAL_BASE + 12 * PAGE_SIZE), None);

        assert_eq!(pages.alloc_order(4, PageAttr::NORMAL, A), None);
        assert_eq!(pages.alloc_order(3, PageAttr::NORMAL, A), Some(NORMAL_BASE));
        assert_eq!(pages.alloc_order(2, PageAttr::NORMAL, A), Some(NORMAL_BASE + 0x8000));
        assert_eq!(pages.alloc(PAGE_SIZE, PageAttr::NORMAL, A), None);
        pages.verify().unwrap();
    }

    #[test]
    fn boot_ranges_are_clipped_to_regions() {
        let mem = [
            desc(NORMAL_BASE, MIB, PageAttr::NORMAL),
            desc(NORMAL_BASE + MIB, MIB, PageAttr::FAST),
        ];
        let kernel = [PhysRange::new(NORMAL_BASE + MIB - PAGE_SIZE, 2 * PAGE_SIZE)];
        let unusable = [PhysRange::new(0x1000, PAGE_SIZE)];
        let boot = BootArgs {
            unusable: &unusable,
            kernel_segments: &kernel,
            archive: None,
        };

        let pages = PageAllocator::try_new(&mem, &boot).unwrap();
        pages.verify().unwrap();

        assert_eq!(pages.regions()[0].usable(), MIB - PAGE_SIZE);
        assert_eq!(pages.regions()[1].usable(), MIB - PAGE_SIZE);
        assert!(pages.valid(NORMAL_BASE + MIB, PAGE_SIZE, Owner::KERNEL));
        assert_eq!(pages.free(NORMAL_BASE + MIB, PAGE_SIZE, Owner::KERNEL), Err(PageError::Invalid));
    }

    #[test]
    fn empty_memory_map_is_invalid() {
        assert_eq!(
            PageAllocator::try_new(&[], &BootArgs::default()).unwrap_err(),
            InitError::InvalidConfig
        );
    }

    #[test]
    fn metadata_layout_is_page_granular() {
        let layout = PageAllocator::metadata_layout(&[desc(0, MIB, PageAttr::NORMAL)]).unwrap();
        assert_eq!(layout.align(), PAGE_SIZE);
        assert_eq!(layout.size() % PAGE_SIZE, 0);
        assert!(layout.size() >= 256 * core::mem::size_of::<crate::page::PageDesc>());
    }
}

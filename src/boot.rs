//! Boot-time inputs and construction of the region directory.

use core::{alloc::Layout, iter, ptr::NonNull};

use crate::{
    bitmap::Bitmap,
    buddy::{FreeList, Region, RegionInner},
    bump::{self, Bump},
    page::PageDesc,
    page_align_down, page_align_up, InitError, Owner, PageAttr, PageState, PhysAddr, Speed,
    PAGE_SHIFT,
};

/// A platform memory descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemDesc {
    /// The physical base address.
    pub base: PhysAddr,
    /// The size in bytes.
    pub size: usize,
    /// The attributes of the memory. Request-only flags are ignored.
    pub attr: PageAttr,
}

/// A range of physical memory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PhysRange {
    /// The physical address of the first byte.
    pub addr: PhysAddr,
    /// The size in bytes.
    pub size: usize,
}

impl PhysRange {
    /// Creates a new range.
    pub const fn new(addr: PhysAddr, size: usize) -> PhysRange {
        PhysRange { addr, size }
    }

    /// Returns the address one past the last byte, or `None` on overflow.
    pub fn end(&self) -> Option<PhysAddr> {
        self.addr.checked_add(self.size)
    }

    /// Returns the range rounded outward to page boundaries, or `None` if it
    /// is empty or overflows.
    pub(crate) fn page_span(&self) -> Option<(PhysAddr, PhysAddr)> {
        if self.size == 0 {
            return None;
        }

        Some((page_align_down(self.addr), page_align_up(self.end()?)?))
    }
}

/// Ranges the allocator must never hand out, as reported by the boot
/// environment.
#[derive(Copy, Clone, Debug, Default)]
pub struct BootArgs<'a> {
    /// Memory the platform reports as unusable, such as ROM or firmware
    /// tables.
    pub unusable: &'a [PhysRange],
    /// The loaded segments of the running kernel image.
    pub kernel_segments: &'a [PhysRange],
    /// The boot archive handed over by the loader, if any.
    pub archive: Option<PhysRange>,
}

impl BootArgs<'_> {
    /// Returns every range that is in use before the allocator exists.
    pub(crate) fn reserved(&self) -> impl Iterator<Item = PhysRange> + '_ {
        self.unusable
            .iter()
            .chain(self.kernel_segments)
            .copied()
            .chain(self.archive)
    }
}

/// Maps physical memory into the caller's address space.
///
/// # Safety
///
/// A pointer returned by `map` must be valid for reads and writes of `len`
/// bytes for the rest of the program, must be aligned at least as strictly
/// as `pa`, and must not alias any memory the program otherwise uses.
pub unsafe trait PhysMapper {
    /// Returns a pointer through which `[pa, pa + len)` can be accessed, or
    /// `None` if the range cannot be mapped.
    fn map(&self, pa: PhysAddr, len: usize) -> Option<NonNull<u8>>;
}

/// A linear mapping of physical memory at a fixed virtual offset.
///
/// An offset of 0 describes an identity-mapped kernel.
#[derive(Copy, Clone, Debug)]
pub struct DirectMap {
    /// The virtual address of physical address 0.
    pub offset: usize,
}

// SAFETY: the kernel that constructs a `DirectMap` promises its physical
// memory is mapped linearly at `offset`.
unsafe impl PhysMapper for DirectMap {
    fn map(&self, pa: PhysAddr, len: usize) -> Option<NonNull<u8>> {
        let va = pa.checked_add(self.offset)?;
        va.checked_add(len)?;

        NonNull::new(sptr::from_exposed_addr_mut(va))
    }
}

/// The placement of a region in the physical address space, and the layouts
/// of its bookkeeping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub attr: PageAttr,
    pub begin: PhysAddr,
    pub end: PhysAddr,
    pub base: PhysAddr,
    pub nr_orders: u32,
    pub pages: Layout,
    pub blocks: Layout,
    pub bitmap: Layout,
}

impl Geometry {
    /// The largest supported universe, in orders. Page indices must fit in
    /// a `u32` alongside the free-list sentinel.
    const MAX_ORDERS: u32 = 32;

    /// Computes the geometry of the region described by `desc`.
    ///
    /// Returns `Ok(None)` if the descriptor contains no full page.
    pub fn of(desc: &MemDesc) -> Result<Option<Geometry>, InitError> {
        let limit = desc.base.checked_add(desc.size).ok_or(InitError::InvalidConfig)?;

        let begin = match page_align_up(desc.base) {
            Some(b) => b,
            None => return Ok(None),
        };
        let end = page_align_down(limit);
        if end <= begin {
            return Ok(None);
        }

        // The aligned universe below `begin` may fall short of `end` when the
        // span straddles a boundary of its own size class.
        let mut size = (end - begin)
            .checked_next_power_of_two()
            .ok_or(InitError::InvalidConfig)?;
        let base = loop {
            let base = begin & !(size - 1);
            if end - base <= size {
                break base;
            }

            size = size.checked_mul(2).ok_or(InitError::InvalidConfig)?;
        };

        let nr_orders = size.trailing_zeros() - PAGE_SHIFT + 1;
        if nr_orders > Self::MAX_ORDERS {
            return Err(InitError::InvalidConfig);
        }

        let nr_pages = 1_usize << (nr_orders - 1);
        let bad_layout = |_| InitError::InvalidConfig;

        Ok(Some(Geometry {
            attr: desc.attr.region_attrs(),
            begin,
            end,
            base,
            nr_orders,
            pages: Layout::array::<PageDesc>(nr_pages).map_err(bad_layout)?,
            blocks: Layout::array::<FreeList>(nr_orders as usize).map_err(bad_layout)?,
            bitmap: Bitmap::map_layout(RegionInner::bitmap_bits(nr_pages)).map_err(bad_layout)?,
        }))
    }

    #[inline]
    pub fn nr_pages(&self) -> usize {
        1 << (self.nr_orders - 1)
    }
}

/// Iterates over `mem` in ascending base order. Descriptors with equal bases
/// keep their relative order.
pub(crate) fn by_base(mem: &[MemDesc]) -> impl Iterator<Item = &MemDesc> + '_ {
    let mut last: Option<(PhysAddr, usize)> = None;

    iter::from_fn(move || {
        let next = mem
            .iter()
            .enumerate()
            .map(|(i, desc)| (desc.base, i))
            .filter(|&key| last.map_or(true, |l| key > l))
            .min()?;

        last = Some(next);
        Some(&mem[next.1])
    })
}

/// Iterates over the geometries of every region in `mem`, in ascending base
/// order.
///
/// `mem` must have passed [`survey`]; descriptors without a full page are
/// skipped.
pub(crate) fn geometries(mem: &[MemDesc]) -> impl Iterator<Item = Geometry> + '_ {
    by_base(mem).filter_map(|desc| Geometry::of(desc).ok().flatten())
}

/// The validated shape of a memory map.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Survey {
    /// The number of regions.
    pub count: usize,
    /// The layout of the region array.
    pub regions: Layout,
    /// The layout of the speed-sorted index.
    pub by_speed: Layout,
    /// The number of bytes the bump arena needs for all bookkeeping.
    pub footprint: usize,
}

/// Validates `mem` and measures the bookkeeping it needs.
pub(crate) fn survey(mem: &[MemDesc]) -> Result<Survey, InitError> {
    let mut count = 0;
    let mut prev: Option<Geometry> = None;

    for desc in by_base(mem) {
        let geom = match Geometry::of(desc)? {
            Some(g) => g,
            None => continue,
        };

        if let Some(p) = prev {
            if p.end > geom.begin {
                return Err(InitError::Overlap {
                    first: p.begin,
                    second: geom.begin,
                });
            }
        }

        prev = Some(geom);
        count += 1;
    }

    let regions = Layout::array::<Region>(count).map_err(|_| InitError::InvalidConfig)?;
    let by_speed = Layout::array::<usize>(count).map_err(|_| InitError::InvalidConfig)?;

    let layouts = iter::once(regions)
        .chain(geometries(mem).flat_map(|g| [g.pages, g.blocks, g.bitmap]))
        .chain(iter::once(by_speed));
    let footprint = bump::footprint(layouts).ok_or(InitError::InvalidConfig)?;

    Ok(Survey {
        count,
        regions,
        by_speed,
        footprint,
    })
}

/// Finds the window that will hold the allocator's bookkeeping.
///
/// The first normal-speed region (in base order) is trimmed around every
/// reserved range; where a reservation splits it, the larger side is kept.
/// Returns the top `needed` bytes of the first window that is large enough.
pub(crate) fn scratch_window(
    mem: &[MemDesc],
    boot: &BootArgs<'_>,
    needed: usize,
) -> Option<(PhysAddr, PhysAddr)> {
    for geom in geometries(mem).filter(|g| g.attr.speed() == Speed::Normal) {
        let (mut lo, mut hi) = (geom.begin, geom.end);

        for (rs, re) in boot.reserved().filter_map(|r| r.page_span()) {
            if lo >= hi {
                break;
            }
            if re <= lo || rs >= hi {
                continue;
            }

            if rs <= lo && re >= hi {
                hi = lo;
            } else if rs <= lo {
                lo = re;
            } else if re >= hi {
                hi = rs;
            } else if rs - lo >= hi - re {
                hi = rs;
            } else {
                lo = re;
            }
        }

        if hi.saturating_sub(lo) >= needed {
            log::info!("page allocator scratch window {:#x}..{:#x}", hi - needed, hi);
            return Some((hi - needed, hi));
        }
    }

    None
}

/// The region directory: every region in base order, and their indices
/// sorted by speed class, slowest first.
#[derive(Debug)]
pub(crate) struct Directory {
    pub regions: NonNull<Region>,
    pub by_speed: NonNull<usize>,
    pub count: usize,
}

/// Builds every region of `mem` with bookkeeping taken from `bump`.
///
/// Each region starts out with its whole universe free except for the holes
/// before `begin` and after `end`.
pub(crate) fn build(
    mem: &[MemDesc],
    survey: &Survey,
    bump: &mut Bump,
) -> Result<Directory, InitError> {
    let regions = bump
        .allocate(survey.regions)
        .ok_or(InitError::NoMemory)?
        .cast::<Region>();

    for (i, geom) in geometries(mem).enumerate() {
        let pages = bump.allocate(geom.pages).ok_or(InitError::NoMemory)?;
        let blocks = bump.allocate(geom.blocks).ok_or(InitError::NoMemory)?;
        let bitmap = bump.allocate(geom.bitmap).ok_or(InitError::NoMemory)?;

        // SAFETY: the bump arena hands out disjoint blocks sized and aligned
        // by the layouts in `geom`, and never reuses them.
        let mut inner =
            unsafe { RegionInner::new(geom.nr_orders, pages.cast(), blocks.cast(), bitmap.cast()) };

        let lead = (geom.begin - geom.base) >> PAGE_SHIFT;
        let backed = (geom.end - geom.base) >> PAGE_SHIFT;
        inner.carve(0, lead, PageState::Hole, Owner::NONE);
        inner.carve(backed, geom.nr_pages() - backed, PageState::Hole, Owner::NONE);

        log::info!(
            "region {:#x}..{:#x} [{}] universe {:#x}+{:#x}, {} orders",
            geom.begin,
            geom.end,
            geom.attr,
            geom.base,
            geom.nr_pages() << PAGE_SHIFT,
            geom.nr_orders,
        );

        // SAFETY: `regions` holds `survey.count` slots and `geometries` yields
        // exactly that many items.
        unsafe {
            regions
                .as_ptr()
                .add(i)
                .write(Region::new(geom.attr, geom.begin, geom.end, geom.base, inner))
        };
    }

    let by_speed = bump
        .allocate(survey.by_speed)
        .ok_or(InitError::NoMemory)?
        .cast::<usize>();

    let mut n = 0;
    for speed in Speed::ALL {
        for (i, geom) in geometries(mem).enumerate() {
            if geom.attr.speed() == speed {
                // SAFETY: every region index is written exactly once.
                unsafe { by_speed.as_ptr().add(n).write(i) };
                n += 1;
            }
        }
    }
    debug_assert_eq!(n, survey.count);

    Ok(Directory {
        regions,
        by_speed,
        count: survey.count,
    })
}


#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use sptr::Strict;

    use super::*;
    use crate::PAGE_SIZE;

    const MIB: usize = 1 << 20;

    fn desc(base: PhysAddr, size: usize, attr: PageAttr) -> MemDesc {
        MemDesc { base, size, attr }
    }

    #[test]
    fn aligned_region_is_its_own_universe() {
        let g = Geometry::of(&desc(0x8000_0000, MIB, PageAttr::NORMAL))
            .unwrap()
            .unwrap();

        assert_eq!((g.begin, g.end, g.base), (0x8000_0000, 0x8010_0000, 0x8000_0000));
        assert_eq!(g.nr_orders, 9);
        assert_eq!(g.nr_pages(), 256);
    }

    #[test]
    fn unaligned_span_is_rounded_inward() {
        let g = Geometry::of(&desc(0x1234, 0x5000, PageAttr::FAST))
            .unwrap()
            .unwrap();

        assert_eq!((g.begin, g.end), (0x2000, 0x6000));
        assert!(g.base <= g.begin && g.end - g.base <= g.nr_pages() * PAGE_SIZE);
        assert_eq!(g.attr, PageAttr::FAST);
    }

    #[test]
    fn straddling_span_doubles_universe() {
        let g = Geometry::of(&desc(0x3000, 0x2000, PageAttr::NORMAL))
            .unwrap()
            .unwrap();

        assert_eq!(g.base, 0);
        assert_eq!(g.nr_pages(), 8);
    }

    #[test]
    fn sub_page_descriptor_is_skipped() {
        assert_eq!(Geometry::of(&desc(0x1001, 0x1000, PageAttr::NORMAL)), Ok(None));
        assert_eq!(Geometry::of(&desc(0x1000, 0, PageAttr::NORMAL)), Ok(None));
    }

    #[test]
    fn overflowing_descriptor_is_invalid() {
        assert_eq!(
            Geometry::of(&desc(usize::MAX - 0xfff, 0x2000, PageAttr::NORMAL)),
            Err(InitError::InvalidConfig)
        );
    }

    #[test]
    fn request_flags_are_stripped() {
        let attr = PageAttr::NORMAL | PageAttr::DMA | PageAttr::REALLOC;
        let g = Geometry::of(&desc(0, MIB, attr)).unwrap().unwrap();
        assert_eq!(g.attr, PageAttr::NORMAL | PageAttr::DMA);
    }

    #[test]
    fn by_base_sorts_stably() {
        let mem = [
            desc(0x3000, 1, PageAttr::NORMAL),
            desc(0x1000, 2, PageAttr::NORMAL),
            desc(0x3000, 3, PageAttr::NORMAL),
            desc(0x2000, 4, PageAttr::NORMAL),
        ];

        let sizes: Vec<usize> = by_base(&mem).map(|d| d.size).collect();
        assert_eq!(sizes, [2, 4, 1, 3]);
    }

    #[test]
    fn survey_counts_and_rejects_overlap() {
        let ok = [
            desc(0x10_0000, MIB, PageAttr::FAST),
            desc(0x80, 0x100, PageAttr::NORMAL),
            desc(0, MIB, PageAttr::NORMAL),
        ];
        assert_eq!(survey(&ok).unwrap().count, 2);

        let bad = [desc(0, MIB, PageAttr::NORMAL), desc(0x8_0000, MIB, PageAttr::FAST)];
        assert_eq!(
            survey(&bad).unwrap_err(),
            InitError::Overlap {
                first: 0,
                second: 0x8_0000
            }
        );
    }

    #[test]
    fn universes_may_overlap_when_spans_do_not() {
        // The second span's universe reaches back over the first span.
        let mem = [desc(0, 0x3000, PageAttr::NORMAL), desc(0x3000, 0x2000, PageAttr::FAST)];
        assert_eq!(survey(&mem).unwrap().count, 2);
    }

    #[test]
    fn scratch_avoids_reservations() {
        let mem = [
            desc(0, MIB, PageAttr::FAST),
            desc(0x1000_0000, MIB, PageAttr::NORMAL),
        ];
        let kernel = [PhysRange::new(0x1008_0000, 0x1_0000)];
        let boot = BootArgs {
            kernel_segments: &kernel,
            ..BootArgs::default()
        };

        // The kernel splits the window; the lower half is larger.
        let (lo, hi) = scratch_window(&mem, &boot, 0x4000).unwrap();
        assert_eq!((lo, hi), (0x1007_c000, 0x1008_0000));

        // Neither half can hold more than the lower one.
        assert!(scratch_window(&mem, &boot, 0x8_0001).is_none());
    }

    #[test]
    fn scratch_trims_edges() {
        let mem = [desc(0, MIB, PageAttr::NORMAL)];
        let unusable = [PhysRange::new(0xf_f000, 0x1000), PhysRange::new(0, 0x80)];
        let boot = BootArgs {
            unusable: &unusable,
            archive: Some(PhysRange::new(0x1000, 0x1800)),
            ..BootArgs::default()
        };

        let (lo, hi) = scratch_window(&mem, &boot, 0xf_c000).unwrap();
        assert_eq!((lo, hi), (0x3000, 0xf_f000));
        assert!(scratch_window(&mem, &boot, 0xf_c001).is_none());
    }

    #[test]
    fn scratch_requires_normal_memory() {
        let mem = [desc(0, MIB, PageAttr::FASTEST)];
        assert!(scratch_window(&mem, &BootArgs::default(), PAGE_SIZE).is_none());
    }

    #[test]
    fn direct_map_offsets_addresses() {
        let map = DirectMap { offset: 0x8000_0000 };
        let p = map.map(0x1000, PAGE_SIZE).unwrap();
        assert_eq!(p.as_ptr().addr(), 0x8000_1000);
        assert!(map.map(usize::MAX, 1).is_none());
    }
}

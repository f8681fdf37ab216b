#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use page_alloc::{BootArgs, MemDesc, Owner, PageAllocator, PageAttr, PAGE_SHIFT, PAGE_SIZE};

const MAX_REGIONS: usize = 4;
const MAX_REGION_PAGES: usize = 512;
const REGION_STRIDE: usize = 1 << 24;

// Arbitrary is not implemented for bitflags types.
#[derive(Clone, Debug)]
struct Attr(PageAttr);

impl Arbitrary<'_> for Attr {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Attr> {
        Ok(Attr(PageAttr::from_bits_truncate(u32::arbitrary(un)?)))
    }
}

#[derive(Clone, Debug)]
struct Region(MemDesc);

impl Arbitrary<'_> for Region {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Region> {
        let slot = usize::from(u8::arbitrary(un)?) % MAX_REGIONS;
        let offset = usize::from(u16::arbitrary(un)?);
        let pages = 1 + usize::from(u16::arbitrary(un)?) % MAX_REGION_PAGES;
        let attr = Attr::arbitrary(un)?.0.region_attrs();

        Ok(Region(MemDesc {
            base: 0x4000_0000 + slot * REGION_STRIDE + offset,
            size: pages * PAGE_SIZE,
            attr,
        }))
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum PageOp {
    AllocOrder { order: u8, attr: Attr },
    Alloc { len: u32, attr: Attr },
    Reserve { addr: u32, len: u16, attr: Attr },
    Free(usize),
    FreePart { index: usize, skip: usize, take: usize },
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    regions: Vec<Region>,
    ops: Vec<PageOp>,
}

fuzz_target!(|args: Args| {
    let mem: Vec<MemDesc> = args.regions.into_iter().map(|r| r.0).collect();
    let pages = match PageAllocator::try_new(&mem, &BootArgs::default()) {
        Ok(p) => p,
        Err(_) => return,
    };

    // (addr, pages, owner)
    let mut outstanding: Vec<(usize, usize, Owner)> = Vec::new();

    for (i, op) in args.ops.into_iter().enumerate() {
        let owner = Owner(0x1_0000 + i);

        match op {
            PageOp::AllocOrder { order, attr } => {
                let order = u32::from(order % 16);
                if let Some(addr) = pages.alloc_order(order, attr.0, owner) {
                    outstanding.push((addr, 1 << order, owner));
                }
            }

            PageOp::Alloc { len, attr } => {
                let len = len as usize;
                if let Some(addr) = pages.alloc(len, attr.0, owner) {
                    outstanding.push((addr, (len + PAGE_SIZE - 1) >> PAGE_SHIFT, owner));
                }
            }

            PageOp::Reserve { addr, len, attr } => {
                let addr = 0x4000_0000 + addr as usize % (MAX_REGIONS * REGION_STRIDE);
                let len = usize::from(len);
                if len == 0 {
                    continue;
                }
                if let Some(start) = pages.reserve(addr, len, attr.0, owner) {
                    let end = (addr + len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                    outstanding.push((start, (end - start) >> PAGE_SHIFT, owner));
                }
            }

            PageOp::Free(index) => {
                if outstanding.is_empty() {
                    continue;
                }
                let (addr, n, owner) = outstanding.swap_remove(index % outstanding.len());
                assert!(pages.valid(addr, n << PAGE_SHIFT, owner));
                pages.free(addr, n << PAGE_SHIFT, owner).unwrap();
            }

            PageOp::FreePart { index, skip, take } => {
                if outstanding.is_empty() {
                    continue;
                }
                let (addr, n, owner) = outstanding.swap_remove(index % outstanding.len());
                let skip = skip % n;
                let take = 1 + take % (n - skip);

                pages
                    .free(addr + (skip << PAGE_SHIFT), take << PAGE_SHIFT, owner)
                    .unwrap();

                if skip > 0 {
                    outstanding.push((addr, skip, owner));
                }
                if skip + take < n {
                    outstanding.push((addr + ((skip + take) << PAGE_SHIFT), n - skip - take, owner));
                }
            }
        }

        pages.verify().unwrap();
    }

    for (addr, n, owner) in outstanding {
        pages.free(addr, n << PAGE_SHIFT, owner).unwrap();
    }

    pages.verify().unwrap();
    for region in pages.regions() {
        assert_eq!(region.free(), region.usable());
    }
});

#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use page_alloc::{BootArgs, MemDesc, PageAllocator, PageAttr, PhysRange};

// Descriptors are confined to a small window so that overlaps are common.
const WINDOW: usize = 1 << 26;

#[derive(Clone, Debug)]
struct Desc(MemDesc);

impl Arbitrary<'_> for Desc {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Desc> {
        Ok(Desc(MemDesc {
            base: usize::arbitrary(un)? % WINDOW,
            size: usize::from(u16::arbitrary(un)?) << 4,
            attr: PageAttr::from_bits_truncate(u32::arbitrary(un)?).region_attrs(),
        }))
    }
}

#[derive(Clone, Debug)]
struct Range(PhysRange);

impl Arbitrary<'_> for Range {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Range> {
        Ok(Range(PhysRange::new(
            usize::arbitrary(un)? % WINDOW,
            usize::from(u16::arbitrary(un)?) << 4,
        )))
    }
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    descs: Vec<Desc>,
    unusable: Vec<Range>,
    kernel: Vec<Range>,
}

fuzz_target!(|args: Args| {
    let mem: Vec<MemDesc> = args.descs.into_iter().map(|d| d.0).collect();
    let unusable: Vec<PhysRange> = args.unusable.into_iter().map(|r| r.0).collect();
    let kernel: Vec<PhysRange> = args.kernel.into_iter().map(|r| r.0).collect();
    let boot = BootArgs {
        unusable: &unusable,
        kernel_segments: &kernel,
        archive: None,
    };

    let pages = match PageAllocator::try_new(&mem, &boot) {
        Ok(p) => p,
        Err(_) => return,
    };

    pages.verify().unwrap();

    for region in pages.regions() {
        assert!(region.free() <= region.usable());
        assert!(region.usable() <= region.end() - region.begin());
        assert!(region.base() <= region.begin());
        assert!(region.end() <= region.base() + region.size());
    }

    let _ = pages.dump().to_string();
});

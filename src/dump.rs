//! Human-readable allocator state.

use core::fmt;

use crate::{buddy::Region, page::PageDesc, Owner, PageState, PAGE_SHIFT};

/// A diagnostic snapshot of every region, rendered through [`fmt::Display`].
///
/// For each region the output lists its bounds and attributes, its byte
/// counters, the population of each non-empty free list, and every run of
/// consecutive non-free backed pages that share a state and an owner:
///
/// ```text
/// region 0: 0x80000000..0x80100000 [normal] base 0x80000000 size 0x100000
///   usable 0x100000 free 0xfd000
///   free blocks: 0:1 2:1 3:1 4:1 5:1 6:1 7:1
///   0x80000000..0x80003000 Fixed Owner(0xa000)
/// ```
///
/// Each region is locked while it is written out, so the sink must not
/// allocate pages from the same allocator.
#[derive(Copy, Clone)]
pub struct Dump<'a> {
    regions: &'a [Region],
}

impl<'a> Dump<'a> {
    pub(crate) fn new(regions: &'a [Region]) -> Dump<'a> {
        Dump { regions }
    }
}

impl fmt::Display for Dump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, region) in self.regions.iter().enumerate() {
            writeln!(
                f,
                "region {}: {:#x}..{:#x} [{}] base {:#x} size {:#x}",
                i,
                region.begin(),
                region.end(),
                region.attr(),
                region.base(),
                region.size(),
            )?;

            let inner = region.lock();
            writeln!(f, "  usable {:#x} free {:#x}", inner.usable, inner.free)?;

            f.write_str("  free blocks:")?;
            for order in 0..region.nr_orders() {
                let n = inner.blocks()[order as usize].len();
                if n > 0 {
                    write!(f, " {}:{}", order, n)?;
                }
            }
            writeln!(f)?;

            let first = region.page_index(region.begin());
            let last = region.page_index(region.end());
            let pages = &inner.pages()[first..last];

            let mut run: Option<(usize, PageState, Owner)> = None;
            for (i, &PageDesc { state, owner, .. }) in pages.iter().enumerate() {
                let key = (state != PageState::Free).then(|| (state, owner));

                match (run, key) {
                    (Some((_, s, o)), Some(k)) if (s, o) == k => continue,
                    _ => (),
                }

                if let Some((start, s, o)) = run.take() {
                    span(f, region, first + start, first + i, s, o)?;
                }
                run = key.map(|(s, o)| (i, s, o));
            }

            if let Some((start, s, o)) = run {
                span(f, region, first + start, last, s, o)?;
            }
        }

        Ok(())
    }
}

fn span(
    f: &mut fmt::Formatter<'_>,
    region: &Region,
    start: usize,
    end: usize,
    state: PageState,
    owner: Owner,
) -> fmt::Result {
    writeln!(
        f,
        "  {:#x}..{:#x} {:?} {:?}",
        region.base() + (start << PAGE_SHIFT),
        region.base() + (end << PAGE_SHIFT),
        state,
        owner,
    )
}

impl fmt::Debug for Dump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dump")
            .field("regions", &self.regions.len())
            .finish()
    }
}

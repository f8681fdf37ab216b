//! The kernel-wide page allocator.
//!
//! [`page_init`] builds the allocator once, during boot, and every other
//! function here forwards to it. Calls made before initialization behave as
//! if no memory exists.

use spin::Once;

use crate::{
    BootArgs, Dump, MemDesc, Owner, PageAllocator, PageAttr, PageError, PhysAddr, PhysMapper, Raw,
};

static PAGES: Once<PageAllocator<Raw>> = Once::new();

/// Builds the global page allocator from the platform memory map.
///
/// Only the first call builds anything; later calls return the allocator
/// built by the first.
///
/// # Panics
///
/// Panics if the memory map is corrupt or leaves no room for the allocator's
/// bookkeeping. The kernel cannot run without physical memory management.
///
/// # Safety
///
/// The same as for [`PageAllocator::bootstrap`].
pub unsafe fn page_init<M>(
    mem: &[MemDesc],
    boot: &BootArgs<'_>,
    mapper: &M,
) -> &'static PageAllocator<Raw>
where
    M: PhysMapper + ?Sized,
{
    PAGES.call_once(|| match unsafe { PageAllocator::bootstrap(mem, boot, mapper) } {
        Ok(pages) => {
            let (usable, free) = pages
                .regions()
                .iter()
                .fold((0, 0), |(u, f), r| (u + r.usable(), f + r.free()));
            log::info!(
                "page allocator ready: {} regions, {:#x} usable, {:#x} free",
                pages.regions().len(),
                usable,
                free,
            );
            pages
        }
        Err(e) => {
            log::error!("page allocator initialization failed: {}", e);
            for desc in mem {
                log::error!("  {:#x}+{:#x} [{}]", desc.base, desc.size, desc.attr);
            }
            for range in boot.reserved() {
                log::error!("  reserved {:#x}+{:#x}", range.addr, range.size);
            }
            panic!("page_init: {}", e);
        }
    })
}

/// Returns the global page allocator, if it has been initialized.
pub fn pages() -> Option<&'static PageAllocator<Raw>> {
    PAGES.get()
}

/// Allocates `2^order` pages. See [`PageAllocator::alloc_order`].
pub fn page_alloc_order(order: u32, attr: PageAttr, owner: Owner) -> Option<PhysAddr> {
    pages()?.alloc_order(order, attr, owner)
}

/// Allocates `len` bytes of whole pages. See [`PageAllocator::alloc`].
pub fn page_alloc(len: usize, attr: PageAttr, owner: Owner) -> Option<PhysAddr> {
    pages()?.alloc(len, attr, owner)
}

/// Reserves a specific range. See [`PageAllocator::reserve`].
pub fn page_reserve(addr: PhysAddr, len: usize, attr: PageAttr, owner: Owner) -> Option<PhysAddr> {
    pages()?.reserve(addr, len, attr, owner)
}

/// Frees a range. See [`PageAllocator::free`].
pub fn page_free(addr: PhysAddr, len: usize, owner: Owner) -> Result<(), PageError> {
    pages().ok_or(PageError::Fault)?.free(addr, len, owner)
}

/// Checks ownership of a range. See [`PageAllocator::valid`].
pub fn page_valid(addr: PhysAddr, len: usize, owner: Owner) -> bool {
    pages().map_or(false, |p| p.valid(addr, len, owner))
}

/// Returns the attributes of a range. See [`PageAllocator::attr_of`].
pub fn page_attr(addr: PhysAddr, len: usize) -> Result<PageAttr, PageError> {
    pages().ok_or(PageError::Invalid)?.attr_of(addr, len)
}

/// Returns a diagnostic view of the global allocator.
pub fn page_dump() -> Option<Dump<'static>> {
    pages().map(PageAllocator::dump)
}

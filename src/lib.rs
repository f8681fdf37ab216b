//! A region-aware binary-buddy physical page allocator.
//!
//! The allocator carves the physical address space reported by the platform
//! into power-of-two [`Region`]s, each with homogeneous [`PageAttr`]ibutes,
//! its own lock, its own page descriptor table and its own buddy bitmap.
//! Requests carry an attribute mask and are served from the best-matching
//! region, degrading first the DMA and cache-coherency attributes and then
//! the speed class when memory is short.
//!
//! The allocator never touches the memory it manages. Physical addresses are
//! plain integers ([`PhysAddr`]) and owners are opaque [`Owner`] tokens.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case               |
//! |--------------------------|-----------|--------------------------|
//! | Allocate                 | O(1)      | O(regions × orders)      |
//! | Free                     | O(1)      | O(pages + orders)        |
//! | Reserve                  | O(pages)  | O(pages × orders)        |
//!
//! ## Construction
//!
//! A kernel builds its allocator once with [`PageAllocator::bootstrap`],
//! which places every bookkeeping structure in a scratch window of normal
//! speed memory and reserves that window, or installs it as the global
//! handle with [`global::page_init`]. Hosted code (and the test suite) can
//! use [`PageAllocator::try_new`], which keeps the bookkeeping on the global
//! heap instead.

#![doc(html_root_url = "https://docs.rs/page_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// `sptr` shadows pointer methods that are inherent on newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod attr;
mod bitmap;
mod boot;
mod buddy;
mod bump;
mod dump;
mod page;
mod pages;

pub mod global;


use core::{alloc::Layout, ptr::NonNull};

pub use crate::{
    attr::{PageAttr, Speed},
    boot::{BootArgs, DirectMap, MemDesc, PhysMapper, PhysRange},
    buddy::Region,
    dump::Dump,
    page::{Owner, PageState},
    pages::PageAllocator,
};

/// A physical address.
///
/// Physical addresses are never dereferenced by this crate.
pub type PhysAddr = usize;

/// Log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// The size of a page, which is also the size of an order-0 block.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Rounds `addr` down to a page boundary.
#[inline]
pub const fn page_align_down(addr: PhysAddr) -> PhysAddr {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to a page boundary, or returns `None` on overflow.
#[inline]
pub const fn page_align_up(addr: PhysAddr) -> Option<PhysAddr> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(a) => Some(page_align_down(a)),
        None => None,
    }
}

/// The error type for allocator constructors.
///
/// Every variant describes a corrupt or unsatisfiable memory map. A kernel
/// has no way to continue from one, which is why [`global::page_init`]
/// panics on them.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// A necessary allocation of bookkeeping memory failed.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    #[error("failed to allocate allocator metadata ({0:?})")]
    AllocFailed(Layout),

    /// No normal-speed memory window is large enough to hold the allocator's
    /// bookkeeping.
    #[error("no memory for page allocator bookkeeping")]
    NoMemory,

    /// Two memory descriptors describe overlapping physical memory.
    #[error("memory regions at {first:#x} and {second:#x} overlap")]
    Overlap {
        /// The start of the lower region.
        first: PhysAddr,
        /// The start of the region overlapping it.
        second: PhysAddr,
    },

    /// The memory map cannot be represented.
    ///
    /// This is returned for descriptors whose end overflows the address
    /// space, or whose buddy universe has too many pages to index.
    #[error("invalid memory map")]
    InvalidConfig,

    /// A range that bootstrap must own could not be reserved.
    #[error("failed to reserve {len:#x} bytes at {addr:#x}")]
    Reserve {
        /// The start of the range.
        addr: PhysAddr,
        /// The length of the range in bytes.
        len: usize,
    },
}

/// The error type for [`PageAllocator::free`] and [`PageAllocator::attr_of`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
    /// The range is not inside a single known region.
    #[error("bad address")]
    Fault,

    /// The range is known, but its pages are not allocated to the caller.
    #[error("invalid argument")]
    Invalid,
}

impl PageError {
    /// Returns the negative errno value traditionally used for this error.
    pub const fn errno(self) -> i32 {
        match self {
            PageError::Fault => -14,
            PageError::Invalid => -22,
        }
    }
}

/// An invariant violation found by [`PageAllocator::verify`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("region {region:#x}: {what}")]
pub struct Corruption {
    /// The `begin` address of the inconsistent region.
    pub region: PhysAddr,
    /// What was found to be inconsistent.
    pub what: &'static str,
}

/// Types which provide the memory that backs an allocator's bookkeeping.
///
/// This trait is sealed and implemented by two marker types:
/// - `Raw` indicates that the bookkeeping lives inside the managed physical
///   memory, in the scratch window chosen by [`PageAllocator::bootstrap`].
///   That memory is reserved forever and never released.
/// - `Global` indicates that the bookkeeping was allocated from the global
///   allocator. It is released when the allocator is dropped.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this
    ///   allocator, and
    /// * `layout` must be the layout that block was allocated with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that bookkeeping lives in raw physical memory.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;

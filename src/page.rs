//! Page descriptors.

use core::fmt;

/// The allocation state of a single physical page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageState {
    /// The page is linked into exactly one free list.
    Free = 0,
    /// The page lies inside a region's buddy universe but has no physical
    /// backing. It is never allocated or freed.
    Hole = 1,
    /// The page is permanently reserved (kernel image, allocator
    /// bookkeeping, platform-unusable memory).
    System = 2,
    /// The page is allocated and pinned.
    Fixed = 3,
    /// The page is allocated and part of a virtual mapping.
    Mapped = 4,
}

impl PageState {
    /// Returns `true` if the page is allocated to a caller.
    #[inline]
    pub const fn is_allocated(self) -> bool {
        matches!(self, PageState::Fixed | PageState::Mapped)
    }

    /// Returns `true` if the page counts towards a region's usable bytes.
    #[inline]
    pub const fn is_usable(self) -> bool {
        !matches!(self, PageState::Hole | PageState::System)
    }
}

/// An opaque identity recorded for every allocated page.
///
/// An owner is an authorization tag, not a pointer: the allocator only ever
/// compares owners for equality. Callers usually pass the address of the
/// object that holds the allocation, so the small reserved values below
/// never collide with a real owner.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Owner(pub usize);

impl Owner {
    /// The owner of free pages and holes.
    pub const NONE: Owner = Owner(0);
    /// The owner of memory reserved for the kernel image and the platform.
    pub const KERNEL: Owner = Owner(1);
    /// The owner of the allocator's own bookkeeping memory.
    pub const ALLOCATOR: Owner = Owner(2);

    /// Creates an owner token from the address of `obj`.
    #[inline]
    pub fn of<T: ?Sized>(obj: &T) -> Owner {
        Owner((obj as *const T).cast::<u8>() as usize)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Owner::NONE => f.write_str("Owner(none)"),
            Owner::KERNEL => f.write_str("Owner(kernel)"),
            Owner::ALLOCATOR => f.write_str("Owner(allocator)"),
            Owner(tok) => write!(f, "Owner({tok:#x})"),
        }
    }
}

/// Sentinel for an empty free-list link.
pub(crate) const NIL: u32 = u32::MAX;

/// The descriptor of one physical page.
///
/// Free pages at the head of a free block also carry the links of that
/// block's free list. The links are page indices rather than pointers, so a
/// descriptor table can live anywhere and be moved as a whole.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub(crate) struct PageDesc {
    pub state: PageState,
    pub owner: Owner,
    pub prev: u32,
    pub next: u32,
}

impl PageDesc {
    /// The descriptor of a free page that is not linked into any list.
    pub const FREE: PageDesc = PageDesc {
        state: PageState::Free,
        owner: Owner::NONE,
        prev: NIL,
        next: NIL,
    };
}

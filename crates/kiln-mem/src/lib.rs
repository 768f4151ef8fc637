//! Guest memory for the kiln translator.
//!
//! This crate owns the 32-bit guest address space (page table, page flags, copy-on-write and
//! grows-down regions) and the per-execution-context [`Tlb`] that bridges guest addresses to the
//! host-side page frames backing them.
//!
//! Every mapping change bumps the address space's *generation*; a [`Tlb`] built from an older
//! generation must be flushed before it is used again (see [`Tlb::refresh`]). Mapping changes
//! are also reported synchronously to a registered [`MappingObserver`] so compiled code covering
//! the affected pages can be thrown away.

mod frame;
mod space;
mod tlb;

pub use frame::PageFrame;
pub use space::{AddressSpace, MappingObserver, MMAP_CEILING, MMAP_FLOOR};
pub use tlb::{Tlb, TLB_BITS, TLB_SIZE};

use bitflags::bitflags;
use thiserror::Error;

#[cfg(test)]
mod tests;

/// A guest virtual address.
pub type Addr = u32;
/// A guest page number (`addr >> PAGE_BITS`).
pub type Page = u32;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;
/// Number of pages in the 32-bit guest address space.
pub const MEM_PAGES: u32 = 1 << (32 - PAGE_BITS);

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(MEM_PAGES as u64 * PAGE_SIZE as u64 == 1u64 << 32);
};

/// Page number containing `addr`.
#[inline]
pub const fn page(addr: Addr) -> Page {
    addr >> PAGE_BITS
}

/// Byte offset of `addr` within its page.
#[inline]
pub const fn page_offset(addr: Addr) -> u32 {
    addr & PAGE_OFFSET_MASK
}

/// `addr` with the page offset masked off.
#[inline]
pub const fn page_base(addr: Addr) -> Addr {
    addr & !PAGE_OFFSET_MASK
}

/// First address of `page`.
#[inline]
pub const fn page_addr(page: Page) -> Addr {
    page << PAGE_BITS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
}

bitflags! {
    /// Per-page mapping attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// An unmapped page directly below this one may be mapped on demand (stack growth).
        const GROWSDOWN = 1 << 3;
        /// The frame is shared with another address space; the first write copies it.
        const COW = 1 << 4;
        /// Writes are visible to every address space sharing the frame (never copied on fork).
        const SHARED = 1 << 5;
        const ANONYMOUS = 1 << 6;
        /// Compiled code exists for this page; the next write translation invalidates it.
        const COMPILED = 1 << 7;
    }
}

impl PageFlags {
    /// Protection bits as understood by `protect`. Bookkeeping bits are preserved separately.
    pub const PROT: PageFlags = PageFlags::READ
        .union(PageFlags::WRITE)
        .union(PageFlags::EXEC);

    pub const RW: PageFlags = PageFlags::READ.union(PageFlags::WRITE);
    pub const RX: PageFlags = PageFlags::READ.union(PageFlags::EXEC);
    pub const RWX: PageFlags = PageFlags::PROT;
}

/// Why a guest access could not be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegvReason {
    /// No mapping covers the address.
    MapErr,
    /// A mapping exists but does not permit the access.
    AccErr,
}

/// A guest-visible memory fault. This is a normal result value, not a host error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub addr: Addr,
    pub access: AccessType,
    pub reason: SegvReason,
}

/// Host-side misuse of the mapping API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("page {page:#x} is not mapped")]
    NotMapped { page: Page },

    #[error("page range {start:#x}+{pages:#x} exceeds the 32-bit address space")]
    OutOfRange { start: Page, pages: u32 },

    #[error("zero-length mapping request")]
    ZeroLength,
}

/// Validate that `[start, start + pages)` lies inside the guest address space.
pub(crate) fn check_range(start: Page, pages: u32) -> Result<(), MapError> {
    match start.checked_add(pages) {
        Some(end) if end <= MEM_PAGES => Ok(()),
        _ => Err(MapError::OutOfRange { start, pages }),
    }
}

use std::sync::Arc;

use crate::{
    page, page_base, page_offset, AccessType, Addr, AddressSpace, MemFault, Page, PageFrame,
    PAGE_BITS, PAGE_SIZE,
};

pub const TLB_BITS: u32 = 10;
pub const TLB_SIZE: usize = 1 << TLB_BITS;

/// Tag value that never matches a page-aligned address.
const TLB_PAGE_EMPTY: Addr = 1;

const _: () = {
    assert!(TLB_PAGE_EMPTY & !crate::PAGE_OFFSET_MASK == 0);
    assert!(TLB_SIZE.is_power_of_two());
};

#[inline]
const fn tlb_index(addr: Addr) -> usize {
    (((addr >> PAGE_BITS) & (TLB_SIZE as u32 - 1)) ^ (addr >> (PAGE_BITS + TLB_BITS))) as usize
}

#[derive(Clone)]
struct TlbEntry {
    /// Page-aligned guest address this entry translates, or `TLB_PAGE_EMPTY`.
    page: Addr,
    /// Equal to `page` when the entry may also be used for writes.
    page_if_writable: Addr,
    frame: Option<Arc<PageFrame>>,
}

impl TlbEntry {
    const EMPTY: TlbEntry = TlbEntry {
        page: TLB_PAGE_EMPTY,
        page_if_writable: TLB_PAGE_EMPTY,
        frame: None,
    };
}

/// Per-execution-context translation cache in front of an [`AddressSpace`].
///
/// Direct-mapped; an entry caches the frame of one guest page, readable and optionally writable.
/// The TLB is only coherent with the address space while [`Tlb::generation`] matches
/// [`AddressSpace::generation`]; call [`Tlb::refresh`] between blocks.
pub struct Tlb {
    space: Arc<AddressSpace>,
    generation: u64,
    dirty_page: Addr,
    fault_addr: Addr,
    entries: Box<[TlbEntry]>,
}

impl Tlb {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        let generation = space.generation();
        Self {
            space,
            generation,
            dirty_page: TLB_PAGE_EMPTY,
            fault_addr: 0,
            entries: vec![TlbEntry::EMPTY; TLB_SIZE].into_boxed_slice(),
        }
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Generation this TLB's contents were built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Flush if the address space changed since the last flush. Cheap when nothing changed.
    #[inline]
    pub fn refresh(&mut self) {
        if self.generation != self.space.generation() {
            self.flush();
        }
    }

    /// Rebind to another address space (e.g. after `execve`-like replacement) and flush.
    pub fn rebind(&mut self, space: Arc<AddressSpace>) {
        self.space = space;
        self.dirty_page = TLB_PAGE_EMPTY;
        self.flush();
    }

    pub fn flush(&mut self) {
        self.generation = self.space.generation();
        self.entries.fill(TlbEntry::EMPTY);
    }

    /// Page most recently translated for writing, if any.
    pub fn dirty_page(&self) -> Option<Page> {
        (self.dirty_page != TLB_PAGE_EMPTY).then(|| page(self.dirty_page))
    }

    /// Address of the last access that failed to translate.
    pub fn fault_addr(&self) -> Addr {
        self.fault_addr
    }

    #[inline]
    fn lookup(&mut self, addr: Addr, access: AccessType) -> Result<&PageFrame, MemFault> {
        let index = tlb_index(addr);
        let tag = page_base(addr);
        let hit = match access {
            AccessType::Read => self.entries[index].page == tag,
            AccessType::Write => self.entries[index].page_if_writable == tag,
        };
        if hit && access == AccessType::Write {
            self.dirty_page = tag;
        }
        if !hit {
            self.handle_miss(addr, access)?;
        }
        self.entries[index]
            .frame
            .as_deref()
            .ok_or(MemFault {
                addr,
                access,
                reason: crate::SegvReason::MapErr,
            })
    }

    #[cold]
    fn handle_miss(&mut self, addr: Addr, access: AccessType) -> Result<(), MemFault> {
        let seen = self.space.generation();
        let result = self.space.translate(addr, access);
        let current = self.space.generation();
        if current != self.generation {
            self.flush();
        }
        let frame = match result {
            Ok(frame) => frame,
            Err(fault) => {
                self.fault_addr = addr;
                return Err(fault);
            }
        };

        let tag = page_base(addr);
        if access == AccessType::Write {
            self.dirty_page = tag;
        }
        let entry = &mut self.entries[tlb_index(addr)];
        entry.frame = Some(frame);
        if current != seen {
            // The mapping moved while translating: the frame serves this access only.
            entry.page = TLB_PAGE_EMPTY;
            entry.page_if_writable = TLB_PAGE_EMPTY;
            return Ok(());
        }
        entry.page = tag;
        entry.page_if_writable = match access {
            AccessType::Write => tag,
            AccessType::Read => TLB_PAGE_EMPTY,
        };
        Ok(())
    }

    /// Read `out.len()` bytes at `addr`. At most one page boundary may be crossed.
    pub fn read(&mut self, addr: Addr, out: &mut [u8]) -> Result<(), MemFault> {
        debug_assert!(out.len() <= PAGE_SIZE as usize);
        let first = first_part(addr, out.len());
        if first == out.len() {
            return self.lookup(addr, AccessType::Read).map(|f| f.read(page_offset(addr), out));
        }

        let next = page_base(addr).wrapping_add(PAGE_SIZE);
        let lo = self.frame(addr, AccessType::Read)?;
        let hi = self.frame(next, AccessType::Read)?;
        let (head, tail) = out.split_at_mut(first);
        lo.read(page_offset(addr), head);
        hi.read(0, tail);
        Ok(())
    }

    /// Write `data` at `addr`. Both pages of a split write are translated before any byte lands.
    pub fn write(&mut self, addr: Addr, data: &[u8]) -> Result<(), MemFault> {
        debug_assert!(data.len() <= PAGE_SIZE as usize);
        let first = first_part(addr, data.len());
        if first == data.len() {
            return self
                .lookup(addr, AccessType::Write)
                .map(|f| f.write(page_offset(addr), data));
        }

        let next = page_base(addr).wrapping_add(PAGE_SIZE);
        let lo = self.frame(addr, AccessType::Write)?;
        let hi = self.frame(next, AccessType::Write)?;
        lo.write(page_offset(addr), &data[..first]);
        hi.write(0, &data[first..]);
        Ok(())
    }

    fn frame(&mut self, addr: Addr, access: AccessType) -> Result<Arc<PageFrame>, MemFault> {
        self.lookup(addr, access)?;
        let fault = MemFault {
            addr,
            access,
            reason: crate::SegvReason::MapErr,
        };
        self.entries[tlb_index(addr)].frame.clone().ok_or(fault)
    }

    pub fn read_u8(&mut self, addr: Addr) -> Result<u8, MemFault> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self, addr: Addr) -> Result<u16, MemFault> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self, addr: Addr) -> Result<u32, MemFault> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u8(&mut self, addr: Addr, value: u8) -> Result<(), MemFault> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&mut self, addr: Addr, value: u16) -> Result<(), MemFault> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: Addr, value: u32) -> Result<(), MemFault> {
        self.write(addr, &value.to_le_bytes())
    }
}

impl std::fmt::Debug for Tlb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tlb")
            .field("generation", &self.generation)
            .field("dirty_page", &self.dirty_page())
            .field("fault_addr", &format_args!("{:#010x}", self.fault_addr))
            .finish_non_exhaustive()
    }
}

/// Bytes of an access of `len` at `addr` that fall within `addr`'s page.
#[inline]
fn first_part(addr: Addr, len: usize) -> usize {
    ((PAGE_SIZE - page_offset(addr)) as usize).min(len)
}

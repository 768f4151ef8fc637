use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{
    check_range, page, AccessType, Addr, MapError, MemFault, Page, PageFlags, PageFrame,
    SegvReason, MEM_PAGES, PAGE_SIZE,
};

/// Highest page considered by [`AddressSpace::find_hole`].
pub const MMAP_CEILING: Page = 0xf7ffd;
/// `find_hole` never returns a page at or below this one.
pub const MMAP_FLOOR: Page = 0x40000;

/// Receives a synchronous callback for every page range whose mapping changes.
///
/// The callback runs while the page table is write-locked, so implementations must not call back
/// into the [`AddressSpace`]. The block cache implements this to drop compiled code.
pub trait MappingObserver: Send + Sync {
    fn on_mapping_changed(&self, start: Page, pages: u32);
}

#[derive(Clone)]
struct PtEntry {
    frame: Arc<PageFrame>,
    flags: PageFlags,
}

impl PtEntry {
    fn anonymous(flags: PageFlags) -> Self {
        Self {
            frame: Arc::new(PageFrame::zeroed()),
            flags: flags | PageFlags::ANONYMOUS,
        }
    }
}

type PageTable = BTreeMap<Page, PtEntry>;

/// A 32-bit guest address space.
///
/// Lock order: the page table lock is always taken before any lock owned by the registered
/// [`MappingObserver`].
pub struct AddressSpace {
    table: RwLock<PageTable>,
    generation: AtomicU64,
    invalidations: AtomicU64,
    observer: Mutex<Option<Weak<dyn MappingObserver>>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            observer: Mutex::new(None),
        }
    }

    /// Register the observer notified of mapping changes, replacing any previous one.
    pub fn set_observer(&self, observer: Weak<dyn MappingObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Current mapping generation. Any TLB tagged with a different value is stale.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn flags(&self, page: Page) -> Option<PageFlags> {
        self.table.read().get(&page).map(|e| e.flags)
    }

    pub fn is_mapped(&self, page: Page) -> bool {
        self.table.read().contains_key(&page)
    }

    pub fn mapped_pages(&self) -> usize {
        self.table.read().len()
    }

    /// Resolve `addr` for a guest access, applying stack growth and copy-on-write as needed.
    ///
    /// Returns the frame backing the page containing `addr`. A write to a page holding compiled
    /// code invalidates that code before the frame is handed out.
    pub fn translate(&self, addr: Addr, access: AccessType) -> Result<Arc<PageFrame>, MemFault> {
        {
            let table = self.table.read();
            if let Some(entry) = table.get(&page(addr)) {
                let fast = match access {
                    AccessType::Read => entry.flags.contains(PageFlags::READ),
                    AccessType::Write => {
                        entry.flags.contains(PageFlags::WRITE)
                            && !entry.flags.intersects(PageFlags::COW | PageFlags::COMPILED)
                    }
                };
                if fast {
                    return Ok(entry.frame.clone());
                }
            }
        }

        let mut table = self.table.write();
        self.translate_slow(&mut table, addr, access)
    }

    fn translate_slow(
        &self,
        table: &mut PageTable,
        addr: Addr,
        access: AccessType,
    ) -> Result<Arc<PageFrame>, MemFault> {
        let page = page(addr);
        let fault = |reason| MemFault {
            addr,
            access,
            reason,
        };

        let mut grown = false;
        if !table.contains_key(&page) {
            if !can_grow_down(table, page) {
                return Err(fault(SegvReason::MapErr));
            }
            table.insert(page, PtEntry::anonymous(PageFlags::RW | PageFlags::GROWSDOWN));
            grown = true;
        }

        let entry = table
            .get_mut(&page)
            .ok_or_else(|| fault(SegvReason::MapErr))?;
        let mut copied = false;
        let mut had_code = false;
        match access {
            AccessType::Read => {
                if !entry.flags.contains(PageFlags::READ) {
                    return Err(fault(SegvReason::AccErr));
                }
            }
            AccessType::Write => {
                if !entry.flags.contains(PageFlags::WRITE) {
                    return Err(fault(SegvReason::AccErr));
                }
                if entry.flags.contains(PageFlags::COW) {
                    entry.frame = Arc::new(entry.frame.duplicate());
                    entry.flags.remove(PageFlags::COW);
                    copied = true;
                }
                if entry.flags.contains(PageFlags::COMPILED) {
                    entry.flags.remove(PageFlags::COMPILED);
                    had_code = true;
                }
            }
        }
        let frame = entry.frame.clone();

        if grown {
            debug!(page = %format_args!("{page:#x}"), "stack grew down");
        }
        if copied {
            trace!(page = %format_args!("{page:#x}"), "copy-on-write fault");
        }
        if grown || copied {
            self.changed(page, 1);
        } else if had_code {
            // Flag-only change; other TLBs may keep their writable entries for this page.
            self.notify(page, 1);
        }
        Ok(frame)
    }

    /// Map `pages` fresh zero-filled pages at `start`, replacing whatever was there.
    pub fn map(&self, start: Page, pages: u32, flags: PageFlags) -> Result<(), MapError> {
        if pages == 0 {
            return Err(MapError::ZeroLength);
        }
        check_range(start, pages)?;
        let mut table = self.table.write();
        for page in start..start + pages {
            table.insert(page, PtEntry::anonymous(flags));
        }
        self.changed(start, pages);
        Ok(())
    }

    /// Map caller-provided frames at `start`, one page per frame.
    ///
    /// Frames stay shared with whoever else holds them, so this is how `SHARED` mappings are built.
    pub fn map_frames(
        &self,
        start: Page,
        frames: &[Arc<PageFrame>],
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let pages = u32::try_from(frames.len()).map_err(|_| MapError::OutOfRange {
            start,
            pages: u32::MAX,
        })?;
        if pages == 0 {
            return Err(MapError::ZeroLength);
        }
        check_range(start, pages)?;
        let mut table = self.table.write();
        for (page, frame) in (start..).zip(frames) {
            table.insert(
                page,
                PtEntry {
                    frame: frame.clone(),
                    flags,
                },
            );
        }
        self.changed(start, pages);
        Ok(())
    }

    /// Unmap `[start, start + pages)`. Fails without changing anything if any page is a hole.
    pub fn unmap(&self, start: Page, pages: u32) -> Result<(), MapError> {
        self.unmap_inner(start, pages, false)
    }

    /// Unmap every mapped page in `[start, start + pages)`, skipping holes.
    pub fn unmap_force(&self, start: Page, pages: u32) -> Result<(), MapError> {
        self.unmap_inner(start, pages, true)
    }

    fn unmap_inner(&self, start: Page, pages: u32, force: bool) -> Result<(), MapError> {
        if pages == 0 {
            return Err(MapError::ZeroLength);
        }
        check_range(start, pages)?;
        let mut table = self.table.write();
        if !force {
            first_hole(&table, start, pages)?;
        }
        let doomed: Vec<Page> = table
            .range(start..start + pages)
            .map(|(&page, _)| page)
            .collect();
        for page in &doomed {
            table.remove(page);
        }
        self.changed(start, pages);
        Ok(())
    }

    /// Replace the protection bits (`READ`/`WRITE`/`EXEC`) of every page in the range.
    pub fn protect(&self, start: Page, pages: u32, prot: PageFlags) -> Result<(), MapError> {
        if pages == 0 {
            return Err(MapError::ZeroLength);
        }
        check_range(start, pages)?;
        let mut table = self.table.write();
        first_hole(&table, start, pages)?;
        for (_, entry) in table.range_mut(start..start + pages) {
            entry.flags = (entry.flags - PageFlags::PROT) | (prot & PageFlags::PROT);
        }
        self.changed(start, pages);
        Ok(())
    }

    /// Copy-on-write fork.
    ///
    /// Every private mapping becomes `COW` in both spaces and shares its frame; `SHARED` mappings
    /// keep sharing writes. Compiled code of this space is invalidated since its pages are about to
    /// be copied on the next write anyway.
    pub fn fork_cow(&self) -> AddressSpace {
        let child = AddressSpace::new();
        let mut table = self.table.write();
        {
            let mut child_table = child.table.write();
            for (&page, entry) in table.iter_mut() {
                if !entry.flags.contains(PageFlags::SHARED) {
                    entry.flags.insert(PageFlags::COW);
                }
                entry.flags.remove(PageFlags::COMPILED);
                child_table.insert(page, entry.clone());
            }
        }
        let runs = mapped_runs(&table);
        for &(start, pages) in &runs {
            self.notify(start, pages);
        }
        self.bump_generation();
        child.bump_generation();
        debug!(runs = runs.len(), pages = table.len(), "forked address space");
        child
    }

    /// Highest free run of `pages` pages between [`MMAP_FLOOR`] and [`MMAP_CEILING`].
    ///
    /// Returns the first page of the run, or `None` when no such run exists (or `pages` is zero).
    pub fn find_hole(&self, pages: u32) -> Option<Page> {
        if pages == 0 {
            return None;
        }
        let table = self.table.read();
        let mut hole_end = MMAP_CEILING + 1;
        for (&mapped, _) in table.range(MMAP_FLOOR + 1..=MMAP_CEILING).rev() {
            if hole_end - (mapped + 1) >= pages {
                return Some(hole_end - pages);
            }
            hole_end = mapped;
        }
        (hole_end - (MMAP_FLOOR + 1) >= pages).then(|| hole_end - pages)
    }

    pub fn is_hole(&self, start: Page, pages: u32) -> bool {
        let end = (start as u64 + pages as u64).min(MEM_PAGES as u64) as Page;
        if end <= start {
            return true;
        }
        self.table.read().range(start..end).next().is_none()
    }

    /// Classify a fault taken by `access` at `addr`. `None` means the access would now succeed.
    pub fn fault_reason(&self, addr: Addr, access: AccessType) -> Option<SegvReason> {
        let table = self.table.read();
        let Some(entry) = table.get(&page(addr)) else {
            return Some(SegvReason::MapErr);
        };
        let needed = match access {
            AccessType::Read => PageFlags::READ,
            AccessType::Write => PageFlags::WRITE,
        };
        (!entry.flags.contains(needed)).then_some(SegvReason::AccErr)
    }

    /// Host-side read that ignores protection bits (loaders, debuggers).
    pub fn read_bytes(&self, addr: Addr, out: &mut [u8]) -> Result<(), MapError> {
        let table = self.table.read();
        for (addr, chunk) in page_chunks(addr, out.len()) {
            let entry = table
                .get(&page(addr))
                .ok_or(MapError::NotMapped { page: page(addr) })?;
            let (lo, hi) = chunk;
            entry.frame.read(crate::page_offset(addr), &mut out[lo..hi]);
        }
        Ok(())
    }

    /// Host-side write that ignores protection bits but still breaks copy-on-write sharing and
    /// drops compiled code on the pages it touches.
    pub fn write_bytes(&self, addr: Addr, data: &[u8]) -> Result<(), MapError> {
        let mut table = self.table.write();
        let chunks = page_chunks(addr, data.len());
        for &(addr, _) in &chunks {
            first_hole(&table, page(addr), 1)?;
        }
        for (addr, (lo, hi)) in chunks {
            let page = page(addr);
            let Some(entry) = table.get_mut(&page) else {
                return Err(MapError::NotMapped { page });
            };
            let mut copied = false;
            if entry.flags.contains(PageFlags::COW) {
                entry.frame = Arc::new(entry.frame.duplicate());
                entry.flags.remove(PageFlags::COW);
                copied = true;
            }
            let had_code = entry.flags.contains(PageFlags::COMPILED);
            entry.flags.remove(PageFlags::COMPILED);
            entry.frame.write(crate::page_offset(addr), &data[lo..hi]);
            if copied {
                self.changed(page, 1);
            } else if had_code {
                self.notify(page, 1);
            }
        }
        Ok(())
    }

    /// Number of observer notifications issued so far.
    ///
    /// Code translated while this value stays unchanged was read from memory that no mapping
    /// change or code-invalidating write has touched since.
    #[inline]
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Acquire)
    }

    /// Mark `pages` (the first and last page of a translated block) as holding compiled code, then
    /// run `install` while the page table is still write-locked.
    ///
    /// A page becoming compiled for the first time bumps the generation so that no TLB keeps a
    /// writable entry that would bypass the invalidating write path. Running `install` under the
    /// same lock means no write can slip in between marking the pages and publishing the code.
    pub fn mark_code<R>(&self, pages: (Page, Page), install: impl FnOnce() -> R) -> R {
        let mut table = self.table.write();
        self.mark_code_locked(&mut table, pages);
        install()
    }

    /// Like [`AddressSpace::mark_code`], but only if no invalidation happened since the caller
    /// observed `seen` from [`AddressSpace::invalidations`]. Returns `None` (without running
    /// `install`) when the code may be stale.
    pub fn publish_code<R>(
        &self,
        pages: (Page, Page),
        seen: u64,
        install: impl FnOnce() -> R,
    ) -> Option<R> {
        let mut table = self.table.write();
        if self.invalidations() != seen {
            return None;
        }
        self.mark_code_locked(&mut table, pages);
        Some(install())
    }

    fn mark_code_locked(&self, table: &mut PageTable, (first, last): (Page, Page)) {
        let mut newly_compiled = false;
        for page in [first, last] {
            if let Some(entry) = table.get_mut(&page) {
                if !entry.flags.contains(PageFlags::COMPILED) {
                    entry.flags.insert(PageFlags::COMPILED);
                    newly_compiled = true;
                }
            }
        }
        if newly_compiled {
            self.bump_generation();
        }
    }

    fn changed(&self, start: Page, pages: u32) {
        self.notify(start, pages);
        let generation = self.bump_generation();
        debug!(
            start = %format_args!("{start:#x}"),
            pages,
            generation,
            "mapping changed"
        );
    }

    fn notify(&self, start: Page, pages: u32) {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        let observer = self.observer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.on_mapping_changed(start, pages);
        }
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pages", &self.mapped_pages())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

fn can_grow_down(table: &PageTable, page: Page) -> bool {
    table
        .range(page.saturating_add(1)..)
        .next()
        .is_some_and(|(_, above)| above.flags.contains(PageFlags::GROWSDOWN))
}

fn first_hole(table: &PageTable, start: Page, pages: u32) -> Result<(), MapError> {
    match (start..start + pages).find(|p| !table.contains_key(p)) {
        Some(page) => Err(MapError::NotMapped { page }),
        None => Ok(()),
    }
}

fn mapped_runs(table: &PageTable) -> Vec<(Page, u32)> {
    let mut runs: Vec<(Page, u32)> = Vec::new();
    for &page in table.keys() {
        match runs.last_mut() {
            Some((start, len)) if *start + *len == page => *len += 1,
            _ => runs.push((page, 1)),
        }
    }
    runs
}

/// Split `[addr, addr + len)` at page boundaries into `(chunk_addr, (lo, hi))` pairs, where
/// `lo..hi` indexes the caller's buffer.
fn page_chunks(addr: Addr, len: usize) -> Vec<(Addr, (usize, usize))> {
    let mut chunks = Vec::new();
    let mut done = 0usize;
    while done < len {
        let at = addr.wrapping_add(done as u32);
        let room = (PAGE_SIZE - crate::page_offset(at)) as usize;
        let n = room.min(len - done);
        chunks.push((at, (done, done + n)));
        done += n;
    }
    chunks
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kiln_gen::{translate_block, Block};
use kiln_mem::{Addr, AddressSpace, MappingObserver, Page, Tlb, MEM_PAGES};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, trace, warn};

use crate::block::{FiberBlock, JUMP_SLOTS};
use crate::config::{ConfigError, FiberConfig};

/// How many times a block compiled against memory that changed underneath it is recompiled before
/// it is handed out uncached.
const PUBLISH_ATTEMPTS: usize = 2;

/// Snapshot of a cache's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live (non-jetsam) blocks.
    pub blocks: usize,
    /// Host bytes taken by live blocks.
    pub bytes: usize,
    pub hash_size: usize,
    /// Blocks invalidated but not yet reclaimed.
    pub jetsam: usize,
}

/// The compiled-code cache of one address space.
///
/// Live blocks are indexed by start address (a chained hash table that doubles as it fills) and
/// by the first and last page they cover (a fixed bucket array). Both indices and every block's
/// link cells are guarded by one mutex. Invalidated blocks move to a jetsam list and stay there
/// until no execution context can still be running them; see [`BlockCache::reclaim`].
pub struct BlockCache {
    space: Arc<AddressSpace>,
    config: FiberConfig,
    indices: Mutex<Indices>,
    /// Held for reading by every context while it may be running a block.
    quiescence: RwLock<()>,
    /// Bumped by every reclamation pass.
    epoch: AtomicU64,
}

/// State guarded by the cache mutex.
pub(crate) struct Indices {
    hash: Vec<Vec<Arc<FiberBlock>>>,
    /// `pages[b][0]` holds blocks whose first page maps to bucket `b`, `pages[b][1]` blocks whose
    /// last page (when different) does.
    pages: Vec<[Vec<Arc<FiberBlock>>; 2]>,
    blocks: usize,
    bytes: usize,
    jetsam: Vec<Arc<FiberBlock>>,
}

impl BlockCache {
    /// Create the cache for `space` and register it as the space's mapping observer.
    pub fn new(space: Arc<AddressSpace>, config: FiberConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let indices = Indices {
            hash: vec![Vec::new(); config.initial_hash_size],
            pages: (0..config.page_buckets).map(|_| Default::default()).collect(),
            blocks: 0,
            bytes: 0,
            jetsam: Vec::new(),
        };
        let cache = Arc::new(Self {
            space,
            config,
            indices: Mutex::new(indices),
            quiescence: RwLock::new(()),
            epoch: AtomicU64::new(0),
        });
        let weak: Weak<Self> = Arc::downgrade(&cache);
        let observer: Weak<dyn MappingObserver> = weak;
        cache.space.set_observer(observer);
        Ok(cache)
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        let ix = self.indices.lock();
        CacheStats {
            blocks: ix.blocks,
            bytes: ix.bytes,
            hash_size: ix.hash.len(),
            jetsam: ix.jetsam.len(),
        }
    }

    /// Live block starting at `addr`.
    pub fn lookup(&self, addr: Addr) -> Option<Arc<FiberBlock>> {
        self.indices.lock().find(addr).cloned()
    }

    /// Insert a translated block, marking its pages as holding code.
    ///
    /// If a live block already starts at the same address that one is kept and returned.
    pub fn insert(&self, block: Block) -> Arc<FiberBlock> {
        let pages = block.pages();
        let fiber = FiberBlock::new(block);
        self.space.mark_code(pages, || self.indices.lock().insert(fiber))
    }

    /// Live block at `addr`, translating and inserting one on a miss.
    ///
    /// Translation runs without the cache mutex held. If guest memory is invalidated while it
    /// runs, the result is thrown away and translated again; should that keep happening the last
    /// translation is returned as a detached block that runs once and is never cached.
    pub fn lookup_or_compile(&self, addr: Addr, tlb: &mut Tlb) -> Arc<FiberBlock> {
        if let Some(fiber) = self.lookup(addr) {
            return fiber;
        }
        let mut attempt = 1;
        loop {
            let seen = self.space.invalidations();
            let fiber = FiberBlock::new(translate_block(addr, tlb));
            let pages = fiber.block().pages();
            if let Some(live) = self
                .space
                .publish_code(pages, seen, || self.indices.lock().insert(fiber.clone()))
            {
                return live;
            }
            if attempt == PUBLISH_ATTEMPTS {
                trace!(addr = %format_args!("{addr:#010x}"), "running uncached block");
                fiber.detach();
                return fiber;
            }
            attempt += 1;
            trace!(addr = %format_args!("{addr:#010x}"), "memory changed during translation");
            tlb.refresh();
        }
    }

    /// Invalidate every block covering a page in `start..end`.
    pub fn invalidate_range(&self, start: Page, end: Page) {
        if start > end {
            warn!(start, end, "ignoring inverted invalidation range");
            return;
        }
        if start == end {
            return;
        }
        let mut ix = self.indices.lock();
        let removed = ix.invalidate(start, end);
        if removed > 0 {
            debug!(
                start = %format_args!("{start:#x}"),
                end = %format_args!("{end:#x}"),
                blocks = removed,
                "invalidated blocks"
            );
        }
    }

    pub fn invalidate_page(&self, page: Page) {
        self.invalidate_range(page, page.saturating_add(1));
    }

    pub fn invalidate_all(&self) {
        self.invalidate_range(0, MEM_PAGES);
    }

    /// Link every slot of `prev` whose guest target is `next`'s start address.
    ///
    /// Refused when either block has already been invalidated. Returns whether any slot was
    /// linked.
    pub fn link(&self, prev: &Arc<FiberBlock>, next: &Arc<FiberBlock>) -> bool {
        if !prev.block().has_jump_slots() {
            return false;
        }
        let ix = self.indices.lock();
        if prev.is_jetsam() || next.is_jetsam() {
            return false;
        }
        let mut linked = false;
        for slot in 0..JUMP_SLOTS {
            if prev.jump_target(slot) == Some(next.start()) {
                prev.link(slot, next, &ix);
                linked = true;
            }
        }
        if linked {
            trace!(
                from = %format_args!("{:#010x}", prev.start()),
                to = %format_args!("{:#010x}", next.start()),
                "linked blocks"
            );
        }
        linked
    }

    /// Release the jetsam list once no execution context can still be running one of its blocks.
    ///
    /// Blocks until every execution context on this cache is between blocks, so the calling thread
    /// must not be inside a run itself. Returns the number of blocks released.
    pub fn reclaim(&self) -> usize {
        if self.indices.lock().jetsam.is_empty() {
            return 0;
        }
        // The cache mutex is not held while waiting: contexts still inside a block may need it to
        // get out.
        let _quiesced = self.quiescence.write();
        let released = std::mem::take(&mut self.indices.lock().jetsam);
        for fiber in &released {
            fiber.mark_reclaimed();
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(blocks = released.len(), epoch, "reclaimed jetsam");
        released.len()
    }

    /// Reclamation passes completed so far. A block handle obtained before a change of epoch must
    /// not be entered again.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn read_quiescence(&self) -> RwLockReadGuard<'_, ()> {
        self.quiescence.read()
    }
}

impl MappingObserver for BlockCache {
    fn on_mapping_changed(&self, start: Page, pages: u32) {
        self.invalidate_range(start, start.saturating_add(pages).min(MEM_PAGES));
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let ix = self.indices.get_mut();
        let live: Vec<_> = ix.hash.drain(..).flatten().collect();
        for fiber in live.iter().chain(ix.jetsam.iter()) {
            fiber.unlink_all(ix);
        }
        ix.pages.clear();
        ix.jetsam.clear();
    }
}

impl Indices {
    fn bucket(&self, addr: Addr) -> usize {
        addr as usize % self.hash.len()
    }

    fn page_bucket(&self, page: Page) -> usize {
        page as usize % self.pages.len()
    }

    fn find(&self, addr: Addr) -> Option<&Arc<FiberBlock>> {
        let found = self.hash[self.bucket(addr)]
            .iter()
            .find(|fiber| fiber.start() == addr)?;
        assert!(!found.is_jetsam(), "jetsam block {found:?} in the live index");
        Some(found)
    }

    fn insert(&mut self, fiber: Arc<FiberBlock>) -> Arc<FiberBlock> {
        if let Some(existing) = self.find(fiber.start()) {
            return existing.clone();
        }
        self.blocks += 1;
        self.bytes += fiber.block().used();
        if self.blocks >= self.hash.len() * 2 {
            self.resize(self.hash.len() * 2);
        }

        let bucket = self.bucket(fiber.start());
        self.hash[bucket].push(fiber.clone());
        let (first, last) = fiber.block().pages();
        let b = self.page_bucket(first);
        self.pages[b][0].push(fiber.clone());
        if last != first {
            let b = self.page_bucket(last);
            self.pages[b][1].push(fiber.clone());
        }
        fiber
    }

    fn resize(&mut self, size: usize) {
        let mut hash = vec![Vec::new(); size];
        for fiber in self.hash.drain(..).flatten() {
            hash[fiber.start() as usize % size].push(fiber);
        }
        self.hash = hash;
        debug!(
            size,
            blocks = self.blocks,
            bytes = self.bytes,
            "resized block hash"
        );
    }

    /// Move every block whose first or last page lies in `start..end` to the jetsam list.
    fn invalidate(&mut self, start: Page, end: Page) -> usize {
        let in_range = |page: Page| (start..end).contains(&page);
        let buckets: Vec<usize> = if (end - start) as usize >= self.pages.len() {
            (0..self.pages.len()).collect()
        } else {
            (start..end).map(|p| self.page_bucket(p)).collect()
        };

        let mut doomed = Vec::new();
        for b in buckets {
            for slot in 0..2 {
                let (hit, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pages[b][slot])
                    .into_iter()
                    .partition(|fiber| {
                        let (first, last) = fiber.block().pages();
                        in_range(if slot == 0 { first } else { last })
                    });
                self.pages[b][slot] = keep;
                doomed.extend(hit);
            }
        }

        let mut removed = 0;
        for fiber in doomed {
            if fiber.is_jetsam() {
                continue;
            }
            self.disconnect(&fiber);
            removed += 1;
        }
        removed
    }

    /// Remove `fiber` from both indices and all link cells, and queue it for reclamation.
    fn disconnect(&mut self, fiber: &Arc<FiberBlock>) {
        let bucket = self.bucket(fiber.start());
        self.hash[bucket].retain(|other| !Arc::ptr_eq(other, fiber));
        let (first, last) = fiber.block().pages();
        for (slot, page) in [(0, first), (1, last)] {
            let b = self.page_bucket(page);
            self.pages[b][slot].retain(|other| !Arc::ptr_eq(other, fiber));
        }

        fiber.unlink_all(self);
        fiber.mark_jetsam(self);
        self.blocks -= 1;
        self.bytes -= fiber.block().used();
        self.jetsam.push(fiber.clone());
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("stats", &self.stats())
            .field("epoch", &self.epoch())
            .finish()
    }
}

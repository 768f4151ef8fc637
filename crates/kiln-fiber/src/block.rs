use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use kiln_gen::Block;
use kiln_mem::Addr;
use parking_lot::Mutex;

use crate::cache::Indices;

/// Number of direct-transfer slots a block can have.
pub const JUMP_SLOTS: usize = 2;

/// A translated block as owned by a [`crate::BlockCache`].
///
/// Instead of patching host code, each jump slot has a *link cell*. An empty cell means the
/// transfer goes back through the dispatch loop to the slot's guest target; a filled cell lets the
/// engine continue straight into the linked block. Inbound links are tracked per slot so that
/// invalidating a block can empty every cell pointing at it.
///
/// All link and back-reference mutation happens under the cache mutex; that is encoded by the
/// `&Indices` argument the mutating methods take.
pub struct FiberBlock {
    block: Block,
    links: [Mutex<Weak<FiberBlock>>; JUMP_SLOTS],
    /// `jumps_from[i]` holds the blocks whose slot `i` links to this block.
    jumps_from: [Mutex<Vec<Weak<FiberBlock>>>; JUMP_SLOTS],
    jetsam: AtomicBool,
    reclaimed: AtomicBool,
}

impl FiberBlock {
    pub(crate) fn new(block: Block) -> Arc<Self> {
        Arc::new(Self {
            block,
            links: Default::default(),
            jumps_from: Default::default(),
            jetsam: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
        })
    }

    /// Mark a block that never entered the cache: it may run once but is never linked or reused.
    pub(crate) fn detach(&self) {
        self.jetsam.store(true, Ordering::Release);
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn start(&self) -> Addr {
        self.block.start()
    }

    pub fn end(&self) -> Addr {
        self.block.end()
    }

    /// Guest target of `slot`. Linking never changes it; an unlinked slot transfers here.
    pub fn jump_target(&self, slot: usize) -> Option<Addr> {
        self.block.jump_target(slot)
    }

    /// Block that `slot` is currently linked to.
    pub fn linked(&self, slot: usize) -> Option<Arc<FiberBlock>> {
        self.links.get(slot)?.lock().upgrade()
    }

    pub fn is_linked(&self, slot: usize) -> bool {
        self.linked(slot).is_some()
    }

    /// Live blocks whose `slot` is linked to this one.
    pub fn jumps_from(&self, slot: usize) -> Vec<Arc<FiberBlock>> {
        self.jumps_from
            .get(slot)
            .map(|list| list.lock().iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Removed from the cache indices and awaiting reclamation.
    pub fn is_jetsam(&self) -> bool {
        self.jetsam.load(Ordering::Acquire)
    }

    /// Released by a reclamation pass. Entering such a block is a bug.
    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::Acquire)
    }

    /// Link `slot` to `next` and register the back-reference.
    pub(crate) fn link(self: &Arc<Self>, slot: usize, next: &Arc<FiberBlock>, _: &Indices) {
        let mut cell = self.links[slot].lock();
        if Weak::as_ptr(&cell) == Arc::as_ptr(next) {
            return;
        }
        if let Some(old) = cell.upgrade() {
            old.forget_inbound(slot, self);
        }
        *cell = Arc::downgrade(next);
        drop(cell);
        next.jumps_from[slot].lock().push(Arc::downgrade(self));
    }

    /// Empty every link cell that points at this block, then every link cell of this block.
    pub(crate) fn unlink_all(self: &Arc<Self>, _: &Indices) {
        for slot in 0..JUMP_SLOTS {
            let inbound = std::mem::take(&mut *self.jumps_from[slot].lock());
            for prev in inbound.iter().filter_map(Weak::upgrade) {
                let mut cell = prev.links[slot].lock();
                if Weak::as_ptr(&cell) == Arc::as_ptr(self) {
                    *cell = Weak::new();
                }
            }

            let target = std::mem::take(&mut *self.links[slot].lock());
            if let Some(target) = target.upgrade() {
                target.forget_inbound(slot, self);
            }
        }
    }

    pub(crate) fn mark_jetsam(&self, _: &Indices) {
        self.jetsam.store(true, Ordering::Release);
    }

    pub(crate) fn mark_reclaimed(&self) {
        self.reclaimed.store(true, Ordering::Release);
    }

    fn forget_inbound(&self, slot: usize, prev: &Arc<FiberBlock>) {
        self.jumps_from[slot]
            .lock()
            .retain(|w| w.as_ptr() != Arc::as_ptr(prev) && w.strong_count() > 0);
    }
}

impl std::fmt::Debug for FiberBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberBlock")
            .field("start", &format_args!("{:#010x}", self.start()))
            .field("end", &format_args!("{:#010x}", self.end()))
            .field("linked", &[self.is_linked(0), self.is_linked(1)])
            .field("jetsam", &self.is_jetsam())
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

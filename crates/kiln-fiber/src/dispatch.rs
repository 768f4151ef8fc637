use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_gen::{translate_one, Interrupt};
use kiln_mem::Tlb;
use parking_lot::RwLockReadGuard;
use tracing::trace;

use crate::block::FiberBlock;
use crate::cache::BlockCache;
use crate::cpu::CpuState;
use crate::engine::{enter, FrameCache};
use crate::interp::{Backend, BlockExit, Interpreter};

/// Requests that an execution context return to its caller as soon as the block it is running
/// finishes. Cheap to clone and usable from any thread.
#[derive(Clone, Debug, Default)]
pub struct Poker(Arc<AtomicBool>);

impl Poker {
    pub fn poke(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// One guest thread: a register file, a TLB, and its private view of the shared block cache.
pub struct ExecutionContext {
    cpu: CpuState,
    tlb: Tlb,
    cache: Arc<BlockCache>,
    backend: Arc<dyn Backend>,
    frame_cache: FrameCache,
    last_block: Option<Arc<FiberBlock>>,
    poke: Poker,
    /// Reclamation epoch the cached block handles were taken in.
    epoch: u64,
}

impl ExecutionContext {
    /// A context running on `cache`'s address space with the portable interpreter.
    pub fn new(cache: Arc<BlockCache>) -> Self {
        Self::with_backend(cache, Arc::new(Interpreter))
    }

    pub fn with_backend(cache: Arc<BlockCache>, backend: Arc<dyn Backend>) -> Self {
        let frame_cache = FrameCache::new(cache.config().frame_cache_size);
        let epoch = cache.epoch();
        Self {
            cpu: CpuState::default(),
            tlb: Tlb::new(cache.space().clone()),
            cache,
            backend,
            frame_cache,
            last_block: None,
            poke: Poker::default(),
            epoch,
        }
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    pub fn tlb_mut(&mut self) -> &mut Tlb {
        &mut self.tlb
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Handle for poking this context from another thread.
    pub fn poker(&self) -> Poker {
        self.poke.clone()
    }

    pub fn poke(&self) {
        self.poke.poke();
    }

    /// Run guest code from `cpu.eip` until an interrupt is raised, then release whatever blocks
    /// became unreachable in the meantime.
    ///
    /// [`Interrupt::Timer`] is synthesized periodically and after a poke so the caller regains
    /// control even when the guest raises nothing itself.
    pub fn run_to_interrupt(&mut self) -> Interrupt {
        self.tlb.refresh();
        let interrupt = if self.cpu.tf {
            self.single_step()
        } else {
            self.run_blocks()
        };
        self.cpu.trapno = Some(interrupt);
        self.cache.reclaim();
        interrupt
    }

    fn run_blocks(&mut self) -> Interrupt {
        let cache = self.cache.clone();
        let mut quiescence = cache.read_quiescence();
        self.sync_epoch();
        loop {
            self.tlb.refresh();
            let ip = self.cpu.eip;
            let fiber = match self.frame_cache.get(ip).cloned() {
                Some(fiber) => fiber,
                None => {
                    trace!(addr = %format_args!("{ip:#010x}"), "frame cache miss");
                    let fiber = cache.lookup_or_compile(ip, &mut self.tlb);
                    self.frame_cache.insert(fiber.clone());
                    fiber
                }
            };
            // Publishing code bumps the generation; drop writable entries for its pages before
            // the block can store to them.
            self.tlb.refresh();
            if let Some(last) = self.last_block.take() {
                cache.link(&last, &fiber);
            }

            let entered = enter(
                &fiber,
                &mut self.cpu,
                &mut self.tlb,
                self.backend.as_ref(),
                &self.poke.0,
                cache.config().timer_interval,
            );
            self.last_block = Some(entered.last);
            if let Some(interrupt) = entered.interrupt {
                return interrupt;
            }

            // Let a pending reclamation through before touching another block.
            RwLockReadGuard::bump(&mut quiescence);
            self.sync_epoch();
        }
    }

    /// Run exactly one instruction outside the cache.
    fn single_step(&mut self) -> Interrupt {
        let block = translate_one(self.cpu.eip, &mut self.tlb);
        self.cpu.cycle = self.cpu.cycle.wrapping_add(1);
        match self.backend.execute(&block, &mut self.cpu, &mut self.tlb) {
            BlockExit::Interrupt(interrupt) => interrupt,
            BlockExit::Slot(_) | BlockExit::Indirect => Interrupt::Debug,
        }
    }

    /// Drop block handles taken before the latest reclamation pass.
    fn sync_epoch(&mut self) {
        let epoch = self.cache.epoch();
        if epoch != self.epoch {
            self.frame_cache.clear();
            self.last_block = None;
            self.epoch = epoch;
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cpu", &self.cpu)
            .field("last_block", &self.last_block)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

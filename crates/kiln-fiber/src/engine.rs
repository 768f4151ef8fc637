use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_gen::Interrupt;
use kiln_mem::{Addr, Tlb};
use tracing::trace;

use crate::block::FiberBlock;
use crate::cpu::CpuState;
use crate::interp::{Backend, BlockExit};

/// Direct-mapped cache of recently run blocks, private to one execution context.
///
/// Not authoritative: a hit is only used if the stored block starts at the requested address and
/// has not been invalidated since it was cached.
pub struct FrameCache {
    entries: Box<[Option<Arc<FiberBlock>>]>,
}

impl FrameCache {
    /// `size` must be a power of two.
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            entries: vec![None; size].into_boxed_slice(),
        }
    }

    #[inline]
    fn index(&self, ip: Addr) -> usize {
        (ip ^ (ip >> 12)) as usize & (self.entries.len() - 1)
    }

    pub fn get(&self, ip: Addr) -> Option<&Arc<FiberBlock>> {
        self.entries[self.index(ip)]
            .as_ref()
            .filter(|fiber| fiber.start() == ip && !fiber.is_jetsam())
    }

    pub fn insert(&mut self, fiber: Arc<FiberBlock>) {
        let index = self.index(fiber.start());
        self.entries[index] = Some(fiber);
    }

    pub fn clear(&mut self) {
        self.entries.fill(None);
    }
}

/// What a run of [`enter`] ended with.
pub(crate) struct Entered {
    pub(crate) interrupt: Option<Interrupt>,
    /// Last block that ran, for link threading.
    pub(crate) last: Arc<FiberBlock>,
}

/// Run `fiber`, then keep following linked jump slots until control leaves the linked chain, an
/// interrupt is raised, or a timer tick is due.
///
/// Every block run counts as one cycle. A pending poke or a cycle count that reaches a multiple of
/// `timer_interval` ends the run with [`Interrupt::Timer`].
pub(crate) fn enter(
    fiber: &Arc<FiberBlock>,
    cpu: &mut CpuState,
    tlb: &mut Tlb,
    backend: &dyn Backend,
    poked: &AtomicBool,
    timer_interval: u64,
) -> Entered {
    let mut fiber = fiber.clone();
    loop {
        assert!(
            !fiber.is_reclaimed(),
            "entered reclaimed block {fiber:?}"
        );
        let exit = backend.execute(fiber.block(), cpu, tlb);
        cpu.cycle = cpu.cycle.wrapping_add(1);

        let next = match exit {
            BlockExit::Interrupt(int) => {
                return Entered {
                    interrupt: Some(int),
                    last: fiber,
                }
            }
            BlockExit::Indirect => None,
            BlockExit::Slot(slot) => fiber.linked(slot),
        };

        if poked.swap(false, Ordering::AcqRel) || cpu.cycle % timer_interval == 0 {
            return Entered {
                interrupt: Some(Interrupt::Timer),
                last: fiber,
            };
        }
        match next {
            Some(next) => {
                trace!(
                    from = %format_args!("{:#010x}", fiber.start()),
                    to = %format_args!("{:#010x}", next.start()),
                    "following link"
                );
                fiber = next;
            }
            None => {
                return Entered {
                    interrupt: None,
                    last: fiber,
                }
            }
        }
    }
}

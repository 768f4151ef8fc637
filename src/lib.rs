//! kiln: a user-mode dynamic binary translator core for 32-bit x86 guests.
//!
//! The work is split across three crates, re-exported here:
//! - [`mem`]: the guest address space and the per-context TLB.
//! - [`gen`]: the instruction decoder and block translator.
//! - [`fiber`]: the shared block cache, block linking, jetsam reclamation and the dispatch loop.
//!
//! A minimal embedding maps some guest code, builds a [`fiber::BlockCache`] over the address
//! space, and drives an [`fiber::ExecutionContext`] until it reports an interrupt:
//!
//! ```
//! use std::sync::Arc;
//!
//! use kiln::fiber::{BlockCache, ExecutionContext, FiberConfig};
//! use kiln::gen::{Interrupt, Reg};
//! use kiln::mem::{AddressSpace, PageFlags};
//!
//! let space = Arc::new(AddressSpace::new());
//! space.map(0x1, 1, PageFlags::RWX).unwrap();
//! // mov eax, 42; int 0x80
//! space.write_bytes(0x1000, &[0xb8, 42, 0, 0, 0, 0xcd, 0x80]).unwrap();
//!
//! let cache = BlockCache::new(space, FiberConfig::default()).unwrap();
//! let mut ctx = ExecutionContext::new(cache);
//! ctx.cpu_mut().eip = 0x1000;
//! assert_eq!(ctx.run_to_interrupt(), Interrupt::Syscall);
//! assert_eq!(ctx.cpu().reg(Reg::Eax), 42);
//! ```

pub use kiln_fiber as fiber;
pub use kiln_gen as gen;
pub use kiln_mem as mem;

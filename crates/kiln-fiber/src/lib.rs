//! Block cache and execution engine.
//!
//! Translated blocks live in a per-address-space [`BlockCache`]. Execution contexts look blocks
//! up (compiling on a miss), run them through a [`Backend`], and *link* a block's direct jump
//! slots to the blocks they were seen to reach so later runs can chain without going back
//! through the cache.
//!
//! When guest memory changes under compiled code, the cache's [`kiln_mem::MappingObserver`]
//! hook removes the affected blocks from its indices, empties every link cell pointing at them,
//! and parks them on a jetsam list. They are released by [`BlockCache::reclaim`] only once
//! every context has left the block it was running, which execution contexts signal by
//! periodically yielding a shared read lock.

mod block;
mod cache;
mod config;
mod cpu;
mod dispatch;
mod engine;
mod interp;

pub use block::{FiberBlock, JUMP_SLOTS};
pub use cache::{BlockCache, CacheStats};
pub use config::{ConfigError, FiberConfig};
pub use cpu::CpuState;
pub use dispatch::{ExecutionContext, Poker};
pub use engine::FrameCache;
pub use interp::{Backend, BlockExit, Interpreter};

//! Guest instruction translation.
//!
//! [`translate_block`] turns a run of 32-bit x86 guest code into a [`Block`]: a list of
//! [`Gadget`]s ending in exactly one terminator, plus up to two direct-transfer *jump slots* that
//! the execution engine may later link straight to other blocks.
//!
//! Guaranteed properties of every block:
//! - it covers at most two guest pages (`page(end) - page(start) <= 1`);
//! - every byte it covers was read through the caller's TLB;
//! - a guest byte that cannot be read ends the block with a fault at the start of the instruction
//!   that needed it, and an unsupported instruction ends it with [`Interrupt::Undefined`].

mod decode;
pub mod gadget;
mod interrupt;
mod reg;
mod translate;

pub use decode::MAX_INSN_LEN;
pub use gadget::{EffAddr, Gadget, Loc, Operand};
pub use interrupt::Interrupt;
pub use reg::{Cond, Reg, Size};
pub use translate::{translate_block, translate_one, Block, BLOCK_BYTE_LIMIT};

#[cfg(test)]
mod tests;

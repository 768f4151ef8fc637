//! The unit of translated code.
//!
//! A block is a flat list of gadgets executed in order against a register file, a TLB and a single
//! "effective address" scratch register. Operations on [`Loc::Mem`] use the address most recently
//! computed by [`Gadget::Lea`] within the same guest instruction.

use kiln_mem::Addr;

use crate::{Cond, Interrupt, Reg, Size};

/// A `[base + index * scale + disp]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffAddr {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    /// Shift applied to `index` (0..=3).
    pub scale: u8,
    pub disp: u32,
    /// Add the thread-local segment base (`GS:` override).
    pub gs: bool,
}

impl EffAddr {
    pub const fn absolute(disp: u32) -> Self {
        Self {
            base: None,
            index: None,
            scale: 0,
            disp,
            gs: false,
        }
    }
}

/// Something that can be read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// A register, accessed through its low byte/word/dword depending on the operand size.
    Reg(Reg),
    /// Bits 8..16 of a register (`AH`, `CH`, `DH`, `BH`).
    RegHigh(Reg),
    /// Memory at the current effective address.
    Mem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Loc(Loc),
    Imm(u32),
}

impl From<Loc> for Operand {
    fn from(loc: Loc) -> Self {
        Operand::Loc(loc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
}

impl AluOp {
    /// Group-1 operation selected by a ModRM `reg` field or by bits 3..6 of a primary opcode.
    pub const fn from_group(index: u8) -> AluOp {
        match index & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    /// `Cmp` and `Test` only update flags.
    pub const fn writes_back(self) -> bool {
        !matches!(self, AluOp::Cmp | AluOp::Test)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Inc,
    Dec,
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gadget {
    /// Start of the guest instruction at `ip`.
    Insn { ip: Addr },
    /// Compute the effective address for the current instruction.
    Lea(EffAddr),
    /// `dst = effective address` (the `LEA` instruction).
    LoadEa { dst: Reg, size: Size },
    Mov { dst: Loc, src: Operand, size: Size },
    /// Zero or sign extension from `from` to `to`.
    Extend {
        dst: Reg,
        src: Loc,
        from: Size,
        to: Size,
        signed: bool,
    },
    Alu {
        op: AluOp,
        dst: Loc,
        src: Operand,
        size: Size,
    },
    Unary { op: UnaryOp, dst: Loc, size: Size },
    Shift {
        op: ShiftOp,
        dst: Loc,
        count: Operand,
        size: Size,
    },
    Push { src: Operand, size: Size },
    Pop { dst: Loc, size: Size },
    Xchg { a: Loc, b: Loc, size: Size },
    SetCc { cond: Cond, dst: Loc },
    CMov {
        cond: Cond,
        dst: Reg,
        src: Loc,
        size: Size,
    },
    /// `CBW`/`CWDE` when `widen` is set, otherwise `CWD`/`CDQ`.
    Convert { size: Size, widen: bool },
    Flag(FlagOp),

    // Terminators. Every block ends with exactly one of these.
    /// Direct transfer through jump slot `slot`.
    Jmp { slot: usize },
    /// Conditional transfer: slot 0 when taken, slot 1 when not.
    Jcc { cond: Cond },
    JmpIndirect { src: Loc, size: Size },
    /// Push `ret` and transfer through slot 0.
    Call { ret: Addr, size: Size },
    CallIndirect { src: Loc, ret: Addr, size: Size },
    Ret { pop: u16, size: Size },
    /// Raise `int` with `eip` set to `ip`.
    Interrupt { int: Interrupt, ip: Addr },
    /// Raise a memory fault on `addr` for the instruction at `ip`.
    Segfault { ip: Addr, addr: Addr },
    /// Fall through to `ip` (block size limit reached).
    Exit { ip: Addr },
}

impl Gadget {
    pub const fn is_terminator(&self) -> bool {
        matches!(
            self,
            Gadget::Jmp { .. }
                | Gadget::Jcc { .. }
                | Gadget::JmpIndirect { .. }
                | Gadget::Call { .. }
                | Gadget::CallIndirect { .. }
                | Gadget::Ret { .. }
                | Gadget::Interrupt { .. }
                | Gadget::Segfault { .. }
                | Gadget::Exit { .. }
        )
    }
}

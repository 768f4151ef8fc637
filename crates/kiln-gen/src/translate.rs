use kiln_mem::{page, Addr, Page, Tlb, MEM_PAGES, PAGE_SIZE};
use tracing::trace;

use crate::decode::{Fetcher, ModRm, Rm, Stop, MAX_INSN_LEN};
use crate::gadget::{AluOp, FlagOp, Gadget, Loc, Operand, ShiftOp, UnaryOp};
use crate::{Cond, Interrupt, Reg, Size};

/// A block stops growing once this many guest bytes have been consumed, which leaves room for one
/// more maximum-length instruction without the block spanning more than two pages.
pub const BLOCK_BYTE_LIMIT: u32 = PAGE_SIZE - MAX_INSN_LEN;

/// A translated run of guest instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    start: Addr,
    end: Addr,
    gadgets: Vec<Gadget>,
    jump_targets: [Option<Addr>; 2],
}

impl Block {
    pub fn start(&self) -> Addr {
        self.start
    }

    /// Last guest byte covered by this block (inclusive).
    pub fn end(&self) -> Addr {
        self.end
    }

    pub fn gadgets(&self) -> &[Gadget] {
        &self.gadgets
    }

    /// Guest address targeted by direct-transfer slot `slot`, if the block has one.
    pub fn jump_target(&self, slot: usize) -> Option<Addr> {
        self.jump_targets.get(slot).copied().flatten()
    }

    pub fn has_jump_slots(&self) -> bool {
        self.jump_targets.iter().any(Option::is_some)
    }

    /// Host bytes taken by the translated code.
    pub fn used(&self) -> usize {
        self.gadgets.len() * std::mem::size_of::<Gadget>()
    }

    /// First and last guest page the block covers; equal for single-page blocks.
    pub fn pages(&self) -> (Page, Page) {
        (page(self.start), page(self.end))
    }
}

enum Step {
    Continue,
    End,
}

struct Gen<'t> {
    fetch: Fetcher<'t>,
    start: Addr,
    /// Start address of the instruction being decoded.
    insn: Addr,
    /// Index of the current instruction's first gadget.
    mark: usize,
    gadgets: Vec<Gadget>,
    jump_targets: [Option<Addr>; 2],
    /// Unreadable byte that ended the block, if any.
    fault: Option<Addr>,
}

/// Translate guest code starting at `start` until the basic block ends or the size limit is hit.
///
/// Every guest byte consumed is read through `tlb`. A byte that cannot be read ends the block with
/// a fault raised at the start of the instruction that needed it.
pub fn translate_block(start: Addr, tlb: &mut Tlb) -> Block {
    trace!(addr = %format_args!("{start:#010x}"), "compiling block");
    let mut gen = Gen::new(start, tlb);
    loop {
        if let Step::End = gen.step() {
            break;
        }
        if gen.consumed() >= BLOCK_BYTE_LIMIT {
            gen.exit();
            break;
        }
    }
    gen.finish()
}

/// Translate exactly one instruction, for single-stepping.
pub fn translate_one(start: Addr, tlb: &mut Tlb) -> Block {
    let mut gen = Gen::new(start, tlb);
    if let Step::Continue = gen.step() {
        gen.exit();
    }
    gen.finish()
}

impl<'t> Gen<'t> {
    fn new(start: Addr, tlb: &'t mut Tlb) -> Self {
        Self {
            fetch: Fetcher::new(tlb, start),
            start,
            insn: start,
            mark: 0,
            gadgets: Vec::with_capacity(16),
            jump_targets: [None, None],
            fault: None,
        }
    }

    fn consumed(&self) -> u32 {
        self.fetch.ip.wrapping_sub(self.start)
    }

    fn exit(&mut self) {
        self.gadgets.push(Gadget::Exit { ip: self.fetch.ip });
    }

    fn finish(self) -> Block {
        let consumed = self.consumed();
        let mut end = if consumed == 0 {
            self.start
        } else {
            self.start.wrapping_add(consumed - 1)
        };
        // The block covers the byte it failed to read, so mapping that page invalidates it.
        if let Some(addr) = self.fault {
            if addr.wrapping_sub(self.start) > end.wrapping_sub(self.start) {
                end = addr;
            }
        }
        assert!(
            page(end).wrapping_sub(page(self.start)) & (MEM_PAGES - 1) <= 1,
            "block {:#x}..={end:#x} spans more than two pages",
            self.start
        );
        debug_assert!(self.gadgets.last().is_some_and(Gadget::is_terminator));
        trace!(
            addr = %format_args!("{:#010x}", self.start),
            end = %format_args!("{end:#010x}"),
            gadgets = self.gadgets.len(),
            "compiled block"
        );
        Block {
            start: self.start,
            end,
            gadgets: self.gadgets,
            jump_targets: self.jump_targets,
        }
    }

    fn step(&mut self) -> Step {
        self.insn = self.fetch.begin_insn();
        self.mark = self.gadgets.len();
        self.gadgets.push(Gadget::Insn { ip: self.insn });
        match self.decode() {
            Ok(step) => step,
            Err(Stop::Fault(addr)) => {
                self.fault = Some(addr);
                self.restart_insn();
                self.gadgets.push(Gadget::Segfault {
                    ip: self.insn,
                    addr,
                });
                Step::End
            }
            Err(Stop::TooLong) => self.undefined(),
        }
    }

    /// Drop whatever the current instruction emitted so far, keeping its marker.
    fn restart_insn(&mut self) {
        self.gadgets.truncate(self.mark + 1);
        self.jump_targets = [None, None];
    }

    fn undefined(&mut self) -> Step {
        self.restart_insn();
        self.gadgets.push(Gadget::Interrupt {
            int: Interrupt::Undefined,
            ip: self.insn,
        });
        Step::End
    }

    fn emit(&mut self, gadget: Gadget) -> Step {
        self.gadgets.push(gadget);
        Step::Continue
    }

    fn end_with(&mut self, gadget: Gadget) -> Step {
        self.gadgets.push(gadget);
        Step::End
    }

    /// Register operand named by a ModRM `reg`/`rm` field at `size`.
    fn reg_loc(index: u8, size: Size) -> Loc {
        match size {
            Size::Byte if index >= 4 => Loc::RegHigh(Reg::from_index(index - 4)),
            _ => Loc::Reg(Reg::from_index(index)),
        }
    }

    /// Operand named by a ModRM `rm` field, emitting its address computation if it is memory.
    fn rm_loc(&mut self, rm: Rm, size: Size) -> Loc {
        match rm {
            Rm::Reg(index) => Self::reg_loc(index, size),
            Rm::Mem(ea) => {
                self.gadgets.push(Gadget::Lea(ea));
                Loc::Mem
            }
        }
    }

    fn rel_target(&self, rel: u32, sz: Size) -> Addr {
        let target = self.fetch.ip.wrapping_add(rel);
        if sz == Size::Word {
            target & 0xffff
        } else {
            target
        }
    }

    fn jump(&mut self, target: Addr) -> Step {
        self.jump_targets[0] = Some(target);
        self.end_with(Gadget::Jmp { slot: 0 })
    }

    fn jcc(&mut self, cond: Cond, target: Addr) -> Step {
        self.jump_targets = [Some(target), Some(self.fetch.ip)];
        self.end_with(Gadget::Jcc { cond })
    }

    fn decode(&mut self) -> Result<Step, Stop> {
        let mut word = false;
        let mut gs = false;
        let op = loop {
            match self.fetch.u8()? {
                0x66 => word = true,
                0x65 => gs = true,
                // Flat segments; LOCK is a no-op for a single translated instruction stream.
                0x26 | 0x2e | 0x36 | 0x3e | 0xf0 => {}
                op => break op,
            }
        };
        let sz = if word { Size::Word } else { Size::Dword };

        let step = match op {
            0x0f => return self.decode_0f(sz, gs),

            0x00..=0x3f if op & 7 < 6 => {
                let alu = AluOp::from_group(op >> 3);
                let size = if op & 1 == 0 { Size::Byte } else { sz };
                match op & 7 {
                    0 | 1 => {
                        let m = self.fetch.modrm(gs)?;
                        let dst = self.rm_loc(m.rm, size);
                        let src = Self::reg_loc(m.reg, size).into();
                        self.emit(Gadget::Alu { op: alu, dst, src, size })
                    }
                    2 | 3 => {
                        let m = self.fetch.modrm(gs)?;
                        let src = self.rm_loc(m.rm, size).into();
                        let dst = Self::reg_loc(m.reg, size);
                        self.emit(Gadget::Alu { op: alu, dst, src, size })
                    }
                    4 => {
                        let imm = self.fetch.u8()? as u32;
                        self.emit(Gadget::Alu {
                            op: alu,
                            dst: Loc::Reg(Reg::Eax),
                            src: Operand::Imm(imm),
                            size: Size::Byte,
                        })
                    }
                    _ => {
                        let imm = self.fetch.imm(word)?;
                        self.emit(Gadget::Alu {
                            op: alu,
                            dst: Loc::Reg(Reg::Eax),
                            src: Operand::Imm(imm),
                            size: sz,
                        })
                    }
                }
            }

            0x40..=0x4f => self.emit(Gadget::Unary {
                op: if op < 0x48 { UnaryOp::Inc } else { UnaryOp::Dec },
                dst: Loc::Reg(Reg::from_index(op)),
                size: sz,
            }),
            0x50..=0x57 => self.emit(Gadget::Push {
                src: Operand::Loc(Loc::Reg(Reg::from_index(op))),
                size: sz,
            }),
            0x58..=0x5f => self.emit(Gadget::Pop {
                dst: Loc::Reg(Reg::from_index(op)),
                size: sz,
            }),
            0x68 => {
                let imm = self.fetch.imm(word)?;
                self.emit(Gadget::Push {
                    src: Operand::Imm(imm),
                    size: sz,
                })
            }
            0x6a => {
                let imm = self.fetch.i8()?;
                self.emit(Gadget::Push {
                    src: Operand::Imm(imm),
                    size: sz,
                })
            }
            0x70..=0x7f => {
                let rel = self.fetch.i8()?;
                let target = self.rel_target(rel, sz);
                self.jcc(Cond::from_opcode(op), target)
            }

            0x80 | 0x81 | 0x83 => {
                let size = if op == 0x80 { Size::Byte } else { sz };
                let m = self.fetch.modrm(gs)?;
                let dst = self.rm_loc(m.rm, size);
                let imm = match op {
                    0x80 => self.fetch.u8()? as u32,
                    0x81 => self.fetch.imm(word)?,
                    _ => self.fetch.i8()?,
                };
                self.emit(Gadget::Alu {
                    op: AluOp::from_group(m.reg),
                    dst,
                    src: Operand::Imm(imm),
                    size,
                })
            }
            0x84 | 0x85 => {
                let size = if op == 0x84 { Size::Byte } else { sz };
                let m = self.fetch.modrm(gs)?;
                let dst = self.rm_loc(m.rm, size);
                let src = Self::reg_loc(m.reg, size).into();
                self.emit(Gadget::Alu {
                    op: AluOp::Test,
                    dst,
                    src,
                    size,
                })
            }
            0x86 | 0x87 => {
                let size = if op == 0x86 { Size::Byte } else { sz };
                let m = self.fetch.modrm(gs)?;
                let a = self.rm_loc(m.rm, size);
                let b = Self::reg_loc(m.reg, size);
                self.emit(Gadget::Xchg { a, b, size })
            }
            0x88..=0x8b => {
                let size = if op & 1 == 0 { Size::Byte } else { sz };
                let m = self.fetch.modrm(gs)?;
                let rm = self.rm_loc(m.rm, size);
                let reg = Self::reg_loc(m.reg, size);
                let (dst, src) = if op < 0x8a { (rm, reg) } else { (reg, rm) };
                self.emit(Gadget::Mov {
                    dst,
                    src: src.into(),
                    size,
                })
            }
            0x8d => {
                let m = self.fetch.modrm(gs)?;
                match m.rm {
                    Rm::Mem(ea) => {
                        // LEA never applies the segment base.
                        self.gadgets.push(Gadget::Lea(crate::EffAddr { gs: false, ..ea }));
                        self.emit(Gadget::LoadEa {
                            dst: Reg::from_index(m.reg),
                            size: sz,
                        })
                    }
                    Rm::Reg(_) => self.undefined(),
                }
            }
            0x8f => {
                let m = self.fetch.modrm(gs)?;
                if m.reg != 0 {
                    return Ok(self.undefined());
                }
                let dst = self.rm_loc(m.rm, sz);
                self.emit(Gadget::Pop { dst, size: sz })
            }
            0x90 => Step::Continue,
            0x91..=0x97 => self.emit(Gadget::Xchg {
                a: Loc::Reg(Reg::Eax),
                b: Loc::Reg(Reg::from_index(op)),
                size: sz,
            }),
            0x98 | 0x99 => self.emit(Gadget::Convert {
                size: sz,
                widen: op == 0x98,
            }),
            0xa8 => {
                let imm = self.fetch.u8()? as u32;
                self.emit(Gadget::Alu {
                    op: AluOp::Test,
                    dst: Loc::Reg(Reg::Eax),
                    src: Operand::Imm(imm),
                    size: Size::Byte,
                })
            }
            0xa9 => {
                let imm = self.fetch.imm(word)?;
                self.emit(Gadget::Alu {
                    op: AluOp::Test,
                    dst: Loc::Reg(Reg::Eax),
                    src: Operand::Imm(imm),
                    size: sz,
                })
            }
            0xb0..=0xb7 => {
                let imm = self.fetch.u8()? as u32;
                self.emit(Gadget::Mov {
                    dst: Self::reg_loc(op & 7, Size::Byte),
                    src: Operand::Imm(imm),
                    size: Size::Byte,
                })
            }
            0xb8..=0xbf => {
                let imm = self.fetch.imm(word)?;
                self.emit(Gadget::Mov {
                    dst: Loc::Reg(Reg::from_index(op)),
                    src: Operand::Imm(imm),
                    size: sz,
                })
            }

            0xc0 | 0xc1 | 0xd0 | 0xd1 | 0xd2 | 0xd3 => {
                let size = if op & 1 == 0 { Size::Byte } else { sz };
                let m = self.fetch.modrm(gs)?;
                let shift = match m.reg {
                    0 => ShiftOp::Rol,
                    1 => ShiftOp::Ror,
                    4 | 6 => ShiftOp::Shl,
                    5 => ShiftOp::Shr,
                    7 => ShiftOp::Sar,
                    _ => return Ok(self.undefined()),
                };
                let dst = self.rm_loc(m.rm, size);
                let count = match op {
                    0xc0 | 0xc1 => Operand::Imm(self.fetch.u8()? as u32),
                    0xd0 | 0xd1 => Operand::Imm(1),
                    _ => Operand::Loc(Loc::Reg(Reg::Ecx)),
                };
                self.emit(Gadget::Shift {
                    op: shift,
                    dst,
                    count,
                    size,
                })
            }
            0xc2 => {
                let pop = self.fetch.u16()?;
                self.end_with(Gadget::Ret { pop, size: sz })
            }
            0xc3 => self.end_with(Gadget::Ret { pop: 0, size: sz }),
            0xc6 | 0xc7 => {
                let size = if op == 0xc6 { Size::Byte } else { sz };
                let m = self.fetch.modrm(gs)?;
                if m.reg != 0 {
                    return Ok(self.undefined());
                }
                let dst = self.rm_loc(m.rm, size);
                let imm = if size == Size::Byte {
                    self.fetch.u8()? as u32
                } else {
                    self.fetch.imm(word)?
                };
                self.emit(Gadget::Mov {
                    dst,
                    src: Operand::Imm(imm),
                    size,
                })
            }
            0xcc => self.end_with(Gadget::Interrupt {
                int: Interrupt::Breakpoint,
                ip: self.fetch.ip,
            }),
            0xcd => {
                let vector = self.fetch.u8()?;
                self.end_with(Gadget::Interrupt {
                    int: Interrupt::from_vector(vector),
                    ip: self.fetch.ip,
                })
            }
            0xe8 => {
                let rel = self.fetch.imm(word)?;
                let target = self.rel_target(rel, sz);
                self.jump_targets[0] = Some(target);
                self.end_with(Gadget::Call {
                    ret: self.fetch.ip,
                    size: sz,
                })
            }
            0xe9 => {
                let rel = self.fetch.imm(word)?;
                let target = self.rel_target(rel, sz);
                self.jump(target)
            }
            0xeb => {
                let rel = self.fetch.i8()?;
                let target = self.rel_target(rel, sz);
                self.jump(target)
            }
            // HLT is privileged.
            0xf4 => self.end_with(Gadget::Interrupt {
                int: Interrupt::Gpf,
                ip: self.insn,
            }),
            0xf5 => self.emit(Gadget::Flag(FlagOp::Cmc)),
            0xf8 => self.emit(Gadget::Flag(FlagOp::Clc)),
            0xf9 => self.emit(Gadget::Flag(FlagOp::Stc)),
            0xfc => self.emit(Gadget::Flag(FlagOp::Cld)),
            0xfd => self.emit(Gadget::Flag(FlagOp::Std)),
            0xf6 | 0xf7 => {
                let size = if op == 0xf6 { Size::Byte } else { sz };
                let m = self.fetch.modrm(gs)?;
                match m.reg {
                    0 | 1 => {
                        let dst = self.rm_loc(m.rm, size);
                        let imm = if size == Size::Byte {
                            self.fetch.u8()? as u32
                        } else {
                            self.fetch.imm(word)?
                        };
                        self.emit(Gadget::Alu {
                            op: AluOp::Test,
                            dst,
                            src: Operand::Imm(imm),
                            size,
                        })
                    }
                    2 | 3 => {
                        let dst = self.rm_loc(m.rm, size);
                        let op = if m.reg == 2 { UnaryOp::Not } else { UnaryOp::Neg };
                        self.emit(Gadget::Unary { op, dst, size })
                    }
                    _ => self.undefined(),
                }
            }
            0xfe => {
                let m = self.fetch.modrm(gs)?;
                let op = match m.reg {
                    0 => UnaryOp::Inc,
                    1 => UnaryOp::Dec,
                    _ => return Ok(self.undefined()),
                };
                let dst = self.rm_loc(m.rm, Size::Byte);
                self.emit(Gadget::Unary {
                    op,
                    dst,
                    size: Size::Byte,
                })
            }
            0xff => self.decode_group5(sz, gs)?,
            _ => self.undefined(),
        };
        Ok(step)
    }

    fn decode_group5(&mut self, sz: Size, gs: bool) -> Result<Step, Stop> {
        let m: ModRm = self.fetch.modrm(gs)?;
        if !matches!(m.reg, 0 | 1 | 2 | 4 | 6) {
            return Ok(self.undefined());
        }
        let src = self.rm_loc(m.rm, sz);
        Ok(match m.reg {
            0 => self.emit(Gadget::Unary {
                op: UnaryOp::Inc,
                dst: src,
                size: sz,
            }),
            1 => self.emit(Gadget::Unary {
                op: UnaryOp::Dec,
                dst: src,
                size: sz,
            }),
            2 => self.end_with(Gadget::CallIndirect {
                src,
                ret: self.fetch.ip,
                size: sz,
            }),
            4 => self.end_with(Gadget::JmpIndirect { src, size: sz }),
            _ => self.emit(Gadget::Push {
                src: src.into(),
                size: sz,
            }),
        })
    }

    fn decode_0f(&mut self, sz: Size, gs: bool) -> Result<Step, Stop> {
        let word = sz == Size::Word;
        let op = self.fetch.u8()?;
        let step = match op {
            0x1f => {
                // Multi-byte NOP; the operand is never accessed.
                let m = self.fetch.modrm(gs)?;
                if m.reg != 0 {
                    return Ok(self.undefined());
                }
                Step::Continue
            }
            0x40..=0x4f => {
                let m = self.fetch.modrm(gs)?;
                let src = self.rm_loc(m.rm, sz);
                self.emit(Gadget::CMov {
                    cond: Cond::from_opcode(op),
                    dst: Reg::from_index(m.reg),
                    src,
                    size: sz,
                })
            }
            0x80..=0x8f => {
                let rel = self.fetch.imm(word)?;
                let target = self.rel_target(rel, sz);
                self.jcc(Cond::from_opcode(op), target)
            }
            0x90..=0x9f => {
                let m = self.fetch.modrm(gs)?;
                let dst = self.rm_loc(m.rm, Size::Byte);
                self.emit(Gadget::SetCc {
                    cond: Cond::from_opcode(op),
                    dst,
                })
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let from = if op & 1 == 0 { Size::Byte } else { Size::Word };
                let m = self.fetch.modrm(gs)?;
                let src = self.rm_loc(m.rm, from);
                self.emit(Gadget::Extend {
                    dst: Reg::from_index(m.reg),
                    src,
                    from,
                    to: sz,
                    signed: op >= 0xbe,
                })
            }
            // UD2 and everything outside the supported subset.
            _ => self.undefined(),
        };
        Ok(step)
    }
}

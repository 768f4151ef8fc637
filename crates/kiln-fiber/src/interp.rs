//! Portable execution backend: a direct interpreter over translated gadgets.

use kiln_gen::gadget::{AluOp, FlagOp, ShiftOp, UnaryOp};
use kiln_gen::{Block, EffAddr, Gadget, Interrupt, Loc, Operand, Reg, Size};
use kiln_mem::{AccessType, Addr, MemFault, Tlb};

use crate::cpu::CpuState;

/// How control left a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Through direct-transfer slot `n`; `eip` holds the slot's guest target.
    Slot(usize),
    /// Through a computed transfer or a fall-through; `eip` holds the next instruction.
    Indirect,
    /// An interrupt was raised; `eip` is where the guest resumes or faulted.
    Interrupt(Interrupt),
}

/// Runs translated blocks against a register file and a TLB.
pub trait Backend: Send + Sync {
    /// Execute `block` from its first gadget to its terminator.
    ///
    /// Guest memory faults are reported as [`Interrupt::Gpf`] with `cpu.eip` at the faulting
    /// instruction and `cpu.segfault_addr`/`cpu.segfault_was_write` describing the access.
    fn execute(&self, block: &Block, cpu: &mut CpuState, tlb: &mut Tlb) -> BlockExit;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Backend for Interpreter {
    fn execute(&self, block: &Block, cpu: &mut CpuState, tlb: &mut Tlb) -> BlockExit {
        let mut m = Machine {
            cpu,
            tlb,
            ea: 0,
            insn: block.start(),
        };
        for gadget in block.gadgets() {
            match m.step(gadget, block) {
                Ok(None) => {}
                Ok(Some(exit)) => return exit,
                Err(fault) => return m.fault(fault),
            }
        }
        panic!("block at {:#010x} has no terminator", block.start());
    }
}

struct Machine<'a> {
    cpu: &'a mut CpuState,
    tlb: &'a mut Tlb,
    /// Effective address computed by the last `Lea`.
    ea: Addr,
    /// Start of the instruction being executed.
    insn: Addr,
}

type Step = Result<Option<BlockExit>, MemFault>;

fn slot_target(block: &Block, slot: usize) -> Addr {
    match block.jump_target(slot) {
        Some(target) => target,
        None => panic!(
            "block at {:#010x} transfers through empty slot {slot}",
            block.start()
        ),
    }
}

impl Machine<'_> {
    fn step(&mut self, gadget: &Gadget, block: &Block) -> Step {
        match *gadget {
            Gadget::Insn { ip } => self.insn = ip,
            Gadget::Lea(ea) => self.ea = self.effective_address(ea),
            Gadget::LoadEa { dst, size } => self.write(Loc::Reg(dst), size, self.ea)?,
            Gadget::Mov { dst, src, size } => {
                let value = self.operand(src, size)?;
                self.write(dst, size, value)?;
            }
            Gadget::Extend {
                dst,
                src,
                from,
                to,
                signed,
            } => {
                let value = self.read(src, from)?;
                let value = if signed { from.sign_extend(value) } else { value };
                self.write(Loc::Reg(dst), to, value)?;
            }
            Gadget::Alu { op, dst, src, size } => {
                let a = self.read(dst, size)?;
                let b = self.operand(src, size)?;
                let result = self.alu(op, a, b, size);
                if op.writes_back() {
                    self.write(dst, size, result)?;
                }
            }
            Gadget::Unary { op, dst, size } => {
                let a = self.read(dst, size)?;
                let result = self.unary(op, a, size);
                self.write(dst, size, result)?;
            }
            Gadget::Shift {
                op,
                dst,
                count,
                size,
            } => {
                let a = self.read(dst, size)?;
                let count = self.operand(count, Size::Byte)? & 0x1f;
                if count != 0 {
                    let result = self.shift(op, a, count, size);
                    self.write(dst, size, result)?;
                }
            }
            Gadget::Push { src, size } => {
                let value = self.operand(src, size)?;
                self.push(value, size)?;
            }
            Gadget::Pop { dst, size } => {
                let value = self.pop(size)?;
                self.write(dst, size, value)?;
            }
            Gadget::Xchg { a, b, size } => {
                let va = self.read(a, size)?;
                let vb = self.read(b, size)?;
                self.write(a, size, vb)?;
                self.write(b, size, va)?;
            }
            Gadget::SetCc { cond, dst } => {
                let value = self.cond(cond) as u32;
                self.write(dst, Size::Byte, value)?;
            }
            Gadget::CMov {
                cond,
                dst,
                src,
                size,
            } => {
                // The source is read even when the move does not happen.
                let value = self.read(src, size)?;
                if self.cond(cond) {
                    self.write(Loc::Reg(dst), size, value)?;
                }
            }
            Gadget::Convert { size, widen } => self.convert(size, widen),
            Gadget::Flag(op) => match op {
                FlagOp::Clc => self.cpu.cf = false,
                FlagOp::Stc => self.cpu.cf = true,
                FlagOp::Cmc => self.cpu.cf = !self.cpu.cf,
                FlagOp::Cld => self.cpu.df = false,
                FlagOp::Std => self.cpu.df = true,
            },

            Gadget::Jmp { slot } => {
                self.cpu.eip = slot_target(block, slot);
                return Ok(Some(BlockExit::Slot(slot)));
            }
            Gadget::Jcc { cond } => {
                let slot = if self.cond(cond) { 0 } else { 1 };
                self.cpu.eip = slot_target(block, slot);
                return Ok(Some(BlockExit::Slot(slot)));
            }
            Gadget::JmpIndirect { src, size } => {
                self.cpu.eip = self.read(src, size)?;
                return Ok(Some(BlockExit::Indirect));
            }
            Gadget::Call { ret, size } => {
                self.push(ret, size)?;
                self.cpu.eip = slot_target(block, 0);
                return Ok(Some(BlockExit::Slot(0)));
            }
            Gadget::CallIndirect { src, ret, size } => {
                let target = self.read(src, size)?;
                self.push(ret, size)?;
                self.cpu.eip = target;
                return Ok(Some(BlockExit::Indirect));
            }
            Gadget::Ret { pop, size } => {
                let target = self.pop(size)?;
                let esp = self.cpu.reg(Reg::Esp).wrapping_add(pop as u32);
                self.cpu.set_reg(Reg::Esp, esp);
                self.cpu.eip = target;
                return Ok(Some(BlockExit::Indirect));
            }
            Gadget::Interrupt { int, ip } => {
                self.cpu.eip = ip;
                return Ok(Some(BlockExit::Interrupt(int)));
            }
            Gadget::Segfault { ip, addr } => {
                self.cpu.eip = ip;
                self.cpu.segfault_addr = addr;
                self.cpu.segfault_was_write = false;
                return Ok(Some(BlockExit::Interrupt(Interrupt::Gpf)));
            }
            Gadget::Exit { ip } => {
                self.cpu.eip = ip;
                return Ok(Some(BlockExit::Indirect));
            }
        }
        Ok(None)
    }

    fn fault(&mut self, fault: MemFault) -> BlockExit {
        self.cpu.eip = self.insn;
        self.cpu.segfault_addr = fault.addr;
        self.cpu.segfault_was_write = fault.access == AccessType::Write;
        BlockExit::Interrupt(Interrupt::Gpf)
    }

    fn effective_address(&self, ea: EffAddr) -> Addr {
        let mut addr = ea.disp;
        if let Some(base) = ea.base {
            addr = addr.wrapping_add(self.cpu.reg(base));
        }
        if let Some(index) = ea.index {
            addr = addr.wrapping_add(self.cpu.reg(index) << ea.scale);
        }
        if ea.gs {
            addr = addr.wrapping_add(self.cpu.tls_ptr);
        }
        addr
    }

    fn read(&mut self, loc: Loc, size: Size) -> Result<u32, MemFault> {
        Ok(match loc {
            Loc::Reg(reg) => self.cpu.reg(reg) & size.mask(),
            Loc::RegHigh(reg) => (self.cpu.reg(reg) >> 8) & 0xff,
            Loc::Mem => self.load(self.ea, size)?,
        })
    }

    fn write(&mut self, loc: Loc, size: Size, value: u32) -> Result<(), MemFault> {
        match loc {
            Loc::Reg(reg) => {
                let old = self.cpu.reg(reg);
                let mask = size.mask();
                self.cpu.set_reg(reg, (old & !mask) | (value & mask));
            }
            Loc::RegHigh(reg) => {
                let old = self.cpu.reg(reg);
                self.cpu.set_reg(reg, (old & !0xff00) | ((value & 0xff) << 8));
            }
            Loc::Mem => self.store(self.ea, size, value)?,
        }
        Ok(())
    }

    fn operand(&mut self, operand: Operand, size: Size) -> Result<u32, MemFault> {
        match operand {
            Operand::Loc(loc) => self.read(loc, size),
            Operand::Imm(imm) => Ok(imm & size.mask()),
        }
    }

    fn load(&mut self, addr: Addr, size: Size) -> Result<u32, MemFault> {
        Ok(match size {
            Size::Byte => self.tlb.read_u8(addr)? as u32,
            Size::Word => self.tlb.read_u16(addr)? as u32,
            Size::Dword => self.tlb.read_u32(addr)?,
        })
    }

    fn store(&mut self, addr: Addr, size: Size, value: u32) -> Result<(), MemFault> {
        match size {
            Size::Byte => self.tlb.write_u8(addr, value as u8),
            Size::Word => self.tlb.write_u16(addr, value as u16),
            Size::Dword => self.tlb.write_u32(addr, value),
        }
    }

    /// The stack pointer only moves once the access succeeded.
    fn push(&mut self, value: u32, size: Size) -> Result<(), MemFault> {
        let esp = self.cpu.reg(Reg::Esp).wrapping_sub(size.bytes() as u32);
        self.store(esp, size, value)?;
        self.cpu.set_reg(Reg::Esp, esp);
        Ok(())
    }

    fn pop(&mut self, size: Size) -> Result<u32, MemFault> {
        let esp = self.cpu.reg(Reg::Esp);
        let value = self.load(esp, size)?;
        self.cpu
            .set_reg(Reg::Esp, esp.wrapping_add(size.bytes() as u32));
        Ok(value)
    }

    fn cond(&self, cond: kiln_gen::Cond) -> bool {
        let c = &self.cpu;
        cond.eval(c.cf, c.pf, c.zf, c.sf, c.of)
    }

    fn set_result_flags(&mut self, result: u32, size: Size) {
        let result = result & size.mask();
        self.cpu.zf = result == 0;
        self.cpu.sf = result & size.sign_bit() != 0;
        self.cpu.pf = (result as u8).count_ones() % 2 == 0;
    }

    fn add(&mut self, a: u32, b: u32, carry: bool, size: Size) -> u32 {
        let wide = a as u64 + b as u64 + carry as u64;
        let result = wide as u32 & size.mask();
        self.cpu.cf = wide > size.mask() as u64;
        self.cpu.of = (a ^ result) & (b ^ result) & size.sign_bit() != 0;
        self.set_result_flags(result, size);
        result
    }

    fn sub(&mut self, a: u32, b: u32, borrow: bool, size: Size) -> u32 {
        let result = a.wrapping_sub(b).wrapping_sub(borrow as u32) & size.mask();
        self.cpu.cf = (a as u64) < b as u64 + borrow as u64;
        self.cpu.of = (a ^ b) & (a ^ result) & size.sign_bit() != 0;
        self.set_result_flags(result, size);
        result
    }

    fn logic(&mut self, result: u32, size: Size) -> u32 {
        self.cpu.cf = false;
        self.cpu.of = false;
        self.set_result_flags(result, size);
        result & size.mask()
    }

    fn alu(&mut self, op: AluOp, a: u32, b: u32, size: Size) -> u32 {
        match op {
            AluOp::Add => self.add(a, b, false, size),
            AluOp::Adc => {
                let carry = self.cpu.cf;
                self.add(a, b, carry, size)
            }
            AluOp::Sub | AluOp::Cmp => self.sub(a, b, false, size),
            AluOp::Sbb => {
                let borrow = self.cpu.cf;
                self.sub(a, b, borrow, size)
            }
            AluOp::And | AluOp::Test => self.logic(a & b, size),
            AluOp::Or => self.logic(a | b, size),
            AluOp::Xor => self.logic(a ^ b, size),
        }
    }

    fn unary(&mut self, op: UnaryOp, a: u32, size: Size) -> u32 {
        match op {
            UnaryOp::Inc | UnaryOp::Dec => {
                // INC and DEC leave CF alone.
                let cf = self.cpu.cf;
                let result = if op == UnaryOp::Inc {
                    self.add(a, 1, false, size)
                } else {
                    self.sub(a, 1, false, size)
                };
                self.cpu.cf = cf;
                result
            }
            UnaryOp::Not => !a & size.mask(),
            UnaryOp::Neg => {
                let result = self.sub(0, a, false, size);
                self.cpu.cf = a != 0;
                result
            }
        }
    }

    /// `count` is already masked to 5 bits and non-zero.
    fn shift(&mut self, op: ShiftOp, a: u32, count: u32, size: Size) -> u32 {
        let bits = size.bits();
        let mask = size.mask();
        let msb = |v: u32| v & size.sign_bit() != 0;
        match op {
            ShiftOp::Shl => {
                let wide = (a as u64) << count;
                let result = wide as u32 & mask;
                self.cpu.cf = (wide >> bits) & 1 != 0;
                self.cpu.of = msb(result) != self.cpu.cf;
                self.set_result_flags(result, size);
                result
            }
            ShiftOp::Shr => {
                let result = (a >> count) & mask;
                self.cpu.cf = (a as u64 >> (count - 1)) & 1 != 0;
                self.cpu.of = msb(a);
                self.set_result_flags(result, size);
                result
            }
            ShiftOp::Sar => {
                let signed = size.sign_extend(a) as i32;
                let result = (signed >> count) as u32 & mask;
                self.cpu.cf = (signed >> (count - 1)) & 1 != 0;
                self.cpu.of = false;
                self.set_result_flags(result, size);
                result
            }
            ShiftOp::Rol | ShiftOp::Ror => {
                let n = count % bits;
                let result = if n == 0 {
                    a
                } else if op == ShiftOp::Rol {
                    ((a << n) | (a >> (bits - n))) & mask
                } else {
                    ((a >> n) | (a << (bits - n))) & mask
                };
                if op == ShiftOp::Rol {
                    self.cpu.cf = result & 1 != 0;
                    self.cpu.of = msb(result) != self.cpu.cf;
                } else {
                    self.cpu.cf = msb(result);
                    self.cpu.of = msb(result) != msb(result << 1);
                }
                result
            }
        }
    }

    fn convert(&mut self, size: Size, widen: bool) {
        let eax = self.cpu.reg(Reg::Eax);
        match (size, widen) {
            // CBW
            (Size::Word, true) => {
                let ax = Size::Byte.sign_extend(eax) & 0xffff;
                self.cpu.set_reg(Reg::Eax, (eax & !0xffff) | ax);
            }
            // CWDE
            (_, true) => self.cpu.set_reg(Reg::Eax, Size::Word.sign_extend(eax)),
            // CWD
            (Size::Word, false) => {
                let dx = if eax & 0x8000 != 0 { 0xffff } else { 0 };
                let edx = self.cpu.reg(Reg::Edx);
                self.cpu.set_reg(Reg::Edx, (edx & !0xffff) | dx);
            }
            // CDQ
            (_, false) => {
                let edx = if eax & 0x8000_0000 != 0 { u32::MAX } else { 0 };
                self.cpu.set_reg(Reg::Edx, edx);
            }
        }
    }
}

use kiln_gen::{Interrupt, Reg};
use kiln_mem::Addr;

/// Guest register file for one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuState {
    regs: [u32; 8],
    pub eip: Addr,

    pub cf: bool,
    pub pf: bool,
    pub zf: bool,
    pub sf: bool,
    pub of: bool,
    pub df: bool,
    /// Trap flag: run one instruction per [`crate::ExecutionContext::run_to_interrupt`] and
    /// report [`Interrupt::Debug`].
    pub tf: bool,

    /// Base added to `GS:`-prefixed memory operands.
    pub tls_ptr: Addr,

    /// Block entries since the context was created.
    pub cycle: u64,

    /// Faulting address and access kind of the last memory fault raised as
    /// [`Interrupt::Gpf`].
    pub segfault_addr: Addr,
    pub segfault_was_write: bool,

    /// Interrupt returned by the most recent run.
    pub trapno: Option<Interrupt>,
}

impl CpuState {
    pub fn reg(&self, reg: Reg) -> u32 {
        self.regs[reg.index()]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.regs[reg.index()] = value;
    }

    pub fn regs(&self) -> &[u32; 8] {
        &self.regs
    }

    /// Arithmetic and control flags packed in `EFLAGS` layout (bit 1 always set).
    pub fn eflags(&self) -> u32 {
        let bit = |set: bool, shift: u32| (set as u32) << shift;
        0x2 | bit(self.cf, 0)
            | bit(self.pf, 2)
            | bit(self.zf, 6)
            | bit(self.sf, 7)
            | bit(self.tf, 8)
            | bit(self.df, 10)
            | bit(self.of, 11)
    }

    pub fn set_eflags(&mut self, eflags: u32) {
        let bit = |shift: u32| eflags & (1 << shift) != 0;
        self.cf = bit(0);
        self.pf = bit(2);
        self.zf = bit(6);
        self.sf = bit(7);
        self.tf = bit(8);
        self.df = bit(10);
        self.of = bit(11);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eflags_layout() {
        let mut cpu = CpuState::default();
        assert_eq!(cpu.eflags(), 0x2);
        cpu.set_eflags(0x0000_0cc5);
        assert!(cpu.cf && cpu.pf && cpu.zf && cpu.sf && cpu.df && cpu.of);
        assert!(!cpu.tf);
        assert_eq!(cpu.eflags(), 0x0cc7);
    }

    #[test]
    fn registers_by_name() {
        let mut cpu = CpuState::default();
        cpu.set_reg(Reg::Esp, 0xbfff_fff0);
        assert_eq!(cpu.reg(Reg::Esp), 0xbfff_fff0);
        assert_eq!(cpu.regs()[4], 0xbfff_fff0);
    }
}

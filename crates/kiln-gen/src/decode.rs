use kiln_mem::{Addr, Tlb};

use crate::{EffAddr, Reg};

/// Architectural limit on the length of one instruction.
pub const MAX_INSN_LEN: u32 = 15;

/// Why decoding of the current instruction stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    /// The byte at this address could not be read.
    Fault(Addr),
    /// The instruction exceeded [`MAX_INSN_LEN`].
    TooLong,
}

/// Instruction byte stream read through a TLB.
pub(crate) struct Fetcher<'t> {
    tlb: &'t mut Tlb,
    pub(crate) ip: Addr,
    insn_start: Addr,
}

impl<'t> Fetcher<'t> {
    pub(crate) fn new(tlb: &'t mut Tlb, ip: Addr) -> Self {
        Self {
            tlb,
            ip,
            insn_start: ip,
        }
    }

    pub(crate) fn begin_insn(&mut self) -> Addr {
        self.insn_start = self.ip;
        self.ip
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Stop> {
        if self.ip.wrapping_sub(self.insn_start) >= MAX_INSN_LEN {
            return Err(Stop::TooLong);
        }
        let byte = self
            .tlb
            .read_u8(self.ip)
            .map_err(|fault| Stop::Fault(fault.addr))?;
        self.ip = self.ip.wrapping_add(1);
        Ok(byte)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Stop> {
        Ok(u16::from_le_bytes([self.u8()?, self.u8()?]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Stop> {
        Ok(u32::from_le_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    /// 8-bit immediate sign-extended to 32 bits.
    pub(crate) fn i8(&mut self) -> Result<u32, Stop> {
        Ok(self.u8()? as i8 as i32 as u32)
    }

    /// Immediate of the operand size; 16-bit immediates are sign-extended.
    pub(crate) fn imm(&mut self, word: bool) -> Result<u32, Stop> {
        if word {
            Ok(self.u16()? as i16 as i32 as u32)
        } else {
            self.u32()
        }
    }

    /// Decode a ModRM byte (and SIB/displacement) using 32-bit addressing.
    pub(crate) fn modrm(&mut self, gs: bool) -> Result<ModRm, Stop> {
        let byte = self.u8()?;
        let mode = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;
        if mode == 3 {
            return Ok(ModRm {
                reg,
                rm: Rm::Reg(rm),
            });
        }

        let mut ea = EffAddr::absolute(0);
        ea.gs = gs;
        if rm == 4 {
            let sib = self.u8()?;
            let index = (sib >> 3) & 7;
            let base = sib & 7;
            ea.scale = sib >> 6;
            if index != 4 {
                ea.index = Some(Reg::from_index(index));
            }
            if !(base == 5 && mode == 0) {
                ea.base = Some(Reg::from_index(base));
            } else {
                ea.disp = self.u32()?;
            }
        } else if rm == 5 && mode == 0 {
            ea.disp = self.u32()?;
        } else {
            ea.base = Some(Reg::from_index(rm));
        }

        match mode {
            1 => ea.disp = ea.disp.wrapping_add(self.i8()?),
            2 => ea.disp = ea.disp.wrapping_add(self.u32()?),
            _ => {}
        }
        Ok(ModRm {
            reg,
            rm: Rm::Mem(ea),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rm {
    Reg(u8),
    Mem(EffAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ModRm {
    pub(crate) reg: u8,
    pub(crate) rm: Rm,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiln_mem::{AddressSpace, PageFlags};

    use super::*;

    fn fetcher_over(bytes: &[u8]) -> (Tlb, Addr) {
        let space = Arc::new(AddressSpace::new());
        space.map(0x10, 1, PageFlags::RX).unwrap();
        space.write_bytes(0x10_000, bytes).unwrap();
        (Tlb::new(space), 0x10_000)
    }

    #[test]
    fn sib_with_disp8() {
        // [ebx + esi*4 + 8]
        let (mut tlb, ip) = fetcher_over(&[0x44, 0xb3, 0x08]);
        let mut f = Fetcher::new(&mut tlb, ip);
        let m = f.modrm(false).unwrap();
        assert_eq!(m.reg, 0);
        assert_eq!(
            m.rm,
            Rm::Mem(EffAddr {
                base: Some(Reg::Ebx),
                index: Some(Reg::Esi),
                scale: 2,
                disp: 8,
                gs: false,
            })
        );
        assert_eq!(f.ip, ip + 3);
    }

    #[test]
    fn absolute_disp32() {
        let (mut tlb, ip) = fetcher_over(&[0x0d, 0x78, 0x56, 0x34, 0x12]);
        let mut f = Fetcher::new(&mut tlb, ip);
        let m = f.modrm(true).unwrap();
        assert_eq!(m.reg, 1);
        let Rm::Mem(ea) = m.rm else {
            panic!("expected memory operand");
        };
        assert_eq!(ea.base, None);
        assert_eq!(ea.disp, 0x1234_5678);
        assert!(ea.gs);
    }

    #[test]
    fn sib_without_base_or_index() {
        // [disp32] via SIB with base=5, index=4.
        let (mut tlb, ip) = fetcher_over(&[0x04, 0x25, 0x00, 0x20, 0x00, 0x00]);
        let mut f = Fetcher::new(&mut tlb, ip);
        let m = f.modrm(false).unwrap();
        assert_eq!(m.rm, Rm::Mem(EffAddr::absolute(0x2000)));
    }

    #[test]
    fn length_limit() {
        let (mut tlb, ip) = fetcher_over(&[0x66; 20]);
        let mut f = Fetcher::new(&mut tlb, ip);
        f.begin_insn();
        for _ in 0..MAX_INSN_LEN {
            f.u8().unwrap();
        }
        assert_eq!(f.u8(), Err(Stop::TooLong));
    }

    #[test]
    fn fault_reports_unreadable_byte() {
        let (mut tlb, _) = fetcher_over(&[]);
        let mut f = Fetcher::new(&mut tlb, 0x10_ffe);
        f.begin_insn();
        f.u16().unwrap();
        assert_eq!(f.u8(), Err(Stop::Fault(0x11_000)));
    }
}

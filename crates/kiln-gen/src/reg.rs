/// The eight 32-bit general purpose registers in encoding order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Reg {
    pub const ALL: [Reg; 8] = [
        Reg::Eax,
        Reg::Ecx,
        Reg::Edx,
        Reg::Ebx,
        Reg::Esp,
        Reg::Ebp,
        Reg::Esi,
        Reg::Edi,
    ];

    /// Register named by the low three bits of `index`.
    #[inline]
    pub const fn from_index(index: u8) -> Reg {
        Self::ALL[(index & 7) as usize]
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Size {
    Byte,
    Word,
    Dword,
}

impl Size {
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Size::Byte => 1,
            Size::Word => 2,
            Size::Dword => 4,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Size::Byte => 0xff,
            Size::Word => 0xffff,
            Size::Dword => 0xffff_ffff,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extend the low `self.bits()` bits of `value` to 32 bits.
    #[inline]
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            Size::Byte => value as u8 as i8 as i32 as u32,
            Size::Word => value as u16 as i16 as i32 as u32,
            Size::Dword => value,
        }
    }
}

/// Condition codes in `Jcc`/`SETcc`/`CMOVcc` encoding order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    /// Condition named by the low four bits of an opcode.
    #[inline]
    pub const fn from_opcode(opcode: u8) -> Cond {
        Self::ALL[(opcode & 0xf) as usize]
    }

    /// Evaluate against the arithmetic flags.
    pub fn eval(self, cf: bool, pf: bool, zf: bool, sf: bool, of: bool) -> bool {
        let base = match self as u8 >> 1 {
            0 => of,
            1 => cf,
            2 => zf,
            3 => cf || zf,
            4 => sf,
            5 => pf,
            6 => sf != of,
            _ => zf || sf != of,
        };
        // Odd encodings are the negation of the preceding even one.
        base ^ (self as u8 & 1 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extension() {
        assert_eq!(Size::Byte.sign_extend(0x80), 0xffff_ff80);
        assert_eq!(Size::Word.sign_extend(0x7fff), 0x7fff);
        assert_eq!(Size::Dword.sign_extend(0x8000_0000), 0x8000_0000);
    }

    #[test]
    fn condition_pairs_negate() {
        for opcode in (0u8..16).step_by(2) {
            let even = Cond::from_opcode(opcode);
            let odd = Cond::from_opcode(opcode + 1);
            for bits in 0u8..32 {
                let f = |i: u32| (bits >> i) & 1 != 0;
                assert_ne!(
                    even.eval(f(0), f(1), f(2), f(3), f(4)),
                    odd.eval(f(0), f(1), f(2), f(3), f(4))
                );
            }
        }
    }

    #[test]
    fn signed_conditions() {
        // 1 < 2: SF=1, OF=0 after `cmp 1, 2`.
        assert!(Cond::L.eval(true, false, false, true, false));
        assert!(!Cond::G.eval(true, false, false, true, false));
        assert!(Cond::Le.eval(false, true, true, false, false));
    }
}

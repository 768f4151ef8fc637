use std::fmt;

/// Interrupt raised by translated code or synthesized by the dispatch loop.
///
/// "No interrupt" is represented as `Option::<Interrupt>::None` by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    Div,
    Debug,
    Nmi,
    Breakpoint,
    Overflow,
    Bound,
    /// Undefined or unsupported instruction.
    Undefined,
    Fpu,
    Double,
    /// General protection, also used for memory faults.
    Gpf,
    /// Synthesized periodically and on poke.
    Timer,
    Syscall,
    /// Any other `INT n` vector.
    Vector(u8),
}

impl Interrupt {
    /// Code handed to the interrupt handling collaborator.
    pub const fn code(self) -> i32 {
        match self {
            Interrupt::Div => 0,
            Interrupt::Debug => 1,
            Interrupt::Nmi => 2,
            Interrupt::Breakpoint => 3,
            Interrupt::Overflow => 4,
            Interrupt::Bound => 5,
            Interrupt::Undefined => 6,
            Interrupt::Fpu => 7,
            Interrupt::Double => 8,
            Interrupt::Gpf => 13,
            Interrupt::Timer => 32,
            Interrupt::Syscall => 0x80,
            Interrupt::Vector(v) => v as i32,
        }
    }

    /// Interrupt raised by `INT vector`.
    pub const fn from_vector(vector: u8) -> Interrupt {
        match vector {
            0 => Interrupt::Div,
            1 => Interrupt::Debug,
            2 => Interrupt::Nmi,
            3 => Interrupt::Breakpoint,
            4 => Interrupt::Overflow,
            5 => Interrupt::Bound,
            6 => Interrupt::Undefined,
            7 => Interrupt::Fpu,
            8 => Interrupt::Double,
            13 => Interrupt::Gpf,
            32 => Interrupt::Timer,
            0x80 => Interrupt::Syscall,
            v => Interrupt::Vector(v),
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Vector(v) => write!(f, "int {v:#04x}"),
            other => write!(f, "{other:?} ({})", other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_round_trips_through_code() {
        for vector in 0..=u8::MAX {
            assert_eq!(Interrupt::from_vector(vector).code(), vector as i32);
        }
    }
}

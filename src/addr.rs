use std::fmt::Display;
use std::ops::{Add, Sub};

use serde::Serialize;

pub type RawPointer = *mut std::ffi::c_void;

/// An address in the address space of the traced process
///
/// Tracer and target share their word width, so addresses are stored as plain `u64`.
#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct Addr(u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub fn u64(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Relocates a link-time address by the load bias of its image
    pub fn biased(vaddr: u64, bias: Addr) -> Addr {
        Addr(bias.0.wrapping_add(vaddr))
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl Add<u64> for Addr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Addr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value)
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value as u64)
    }
}

impl From<Addr> for u64 {
    fn from(value: Addr) -> Self {
        value.0
    }
}

impl From<Addr> for RawPointer {
    fn from(value: Addr) -> Self {
        value.0 as RawPointer
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_addr_arithmetic() {
        let a = Addr::from(0x1000u64);
        assert_eq!((a + 0x10).u64(), 0x1010);
        assert_eq!((a - 1).u64(), 0xfff);
    }

    #[test]
    fn test_addr_biased() {
        let bias = Addr::from(0x5555_5555_4000u64);
        assert_eq!(Addr::biased(0x1139, bias).u64(), 0x5555_5555_5139);
        assert_eq!(Addr::biased(0x401000, Addr::NULL).u64(), 0x401000);
    }

    #[test]
    fn test_addr_display() {
        let a = Addr::from(0x1234u64);
        assert_eq!(format!("{a}"), "0x0000000000001234");
        assert_eq!(format!("{a:?}"), "0x0000000000001234");
    }
}

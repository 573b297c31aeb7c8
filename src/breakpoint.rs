//! # Breakpoint Manager
//!
//! Installs and removes software breakpoints in the text of a stopped process. The trap
//! encoding is spliced into the low-order bytes of the machine word at the breakpoint site,
//! one byte (`int3`) on x86-64 and one full instruction (`brk #0`) on AArch64. The original word
//! is saved before the patch is written, so restoring puts the exact bytes back.

use nix::unistd::Pid;
use serde::Serialize;
use tracing::trace;

use crate::addr::Addr;
use crate::errors::{Result, TracerError};
use crate::{mem_read_word, mem_write_word, Word};

pub const INT3: Word = 0x0000_0000_0000_00cc;
pub const INT3_MASK: Word = 0x0000_0000_0000_00ff;
pub const BRK0: Word = 0x0000_0000_d420_0000;
pub const BRK0_MASK: Word = 0x0000_0000_ffff_ffff;

/// Instruction set of the traced process
///
/// Tracer and target always share it, so [`Arch::NATIVE`] is what the tracer uses. The other
/// variant only exists so both encodings can be exercised anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    #[cfg(target_arch = "x86_64")]
    pub const NATIVE: Arch = Arch::X86_64;
    #[cfg(target_arch = "aarch64")]
    pub const NATIVE: Arch = Arch::Aarch64;

    /// Number of bytes a breakpoint overwrites
    pub const fn patch_width(self) -> usize {
        match self {
            Arch::X86_64 => 1,
            Arch::Aarch64 => 4,
        }
    }

    /// How far past the breakpoint site the instruction pointer is after the trap
    pub const fn trap_pc_offset(self) -> u64 {
        match self {
            Arch::X86_64 => 1,
            Arch::Aarch64 => 0,
        }
    }

    const fn trap(self) -> (Word, Word) {
        match self {
            Arch::X86_64 => (INT3, INT3_MASK),
            Arch::Aarch64 => (BRK0, BRK0_MASK),
        }
    }

    /// Returns `word` with the trap encoding in its low-order bytes
    pub fn patch(self, word: Word) -> Word {
        let (trap, mask) = self.trap();
        (word & !mask) | trap
    }

    /// Returns `current` with its low-order bytes taken from `original`
    pub fn unpatch(self, current: Word, original: Word) -> Word {
        let (_, mask) = self.trap();
        (current & !mask) | (original & mask)
    }
}

/// Word-sized access to the text of a stopped process
pub trait TextMemory {
    fn read_word(&mut self, addr: Addr) -> Result<Word>;
    fn write_word(&mut self, addr: Addr, value: Word) -> Result<()>;
}

/// The text of a traced process, accessed with `PTRACE_PEEKTEXT` and `PTRACE_POKETEXT`
#[derive(Debug, Clone, Copy)]
pub struct ProcessText(pub Pid);

impl TextMemory for ProcessText {
    fn read_word(&mut self, addr: Addr) -> Result<Word> {
        mem_read_word(self.0, addr)
    }

    fn write_word(&mut self, addr: Addr, value: Word) -> Result<()> {
        mem_write_word(self.0, addr, value)
    }
}

/// An interception site in the traced process
#[derive(Debug, Clone, Serialize)]
pub struct Breakpoint {
    addr: Addr,
    symbol: String,
    /// Runtime address to jump to instead of running the function, if any
    redirect: Option<Addr>,
    #[serde(skip)]
    saved_word: Option<Word>,
    #[serde(skip)]
    hits: usize,
}

impl Breakpoint {
    pub fn new(addr: Addr, symbol: impl Into<String>, redirect: Option<Addr>) -> Self {
        Self {
            addr,
            symbol: symbol.into(),
            redirect: redirect.filter(|r| !r.is_null()),
            saved_word: None,
            hits: 0,
        }
    }

    #[inline]
    pub fn addr(&self) -> Addr {
        self.addr
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[inline]
    pub fn redirect(&self) -> Option<Addr> {
        self.redirect
    }

    #[inline]
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub(crate) fn record_hit(&mut self) {
        self.hits += 1;
    }

    #[inline]
    pub fn is_installed(&self) -> bool {
        self.saved_word.is_some()
    }

    /// The word found at the site before the patch was written
    #[inline]
    pub fn saved_word(&self) -> Option<Word> {
        self.saved_word
    }

    /// Writes the trap encoding to the site and returns the number of bytes altered
    ///
    /// # Errors
    ///
    /// Fails if the breakpoint is installed already (the saved word stays as it is) or if the
    /// memory cannot be read or written. On failure nothing is saved.
    pub fn install(&mut self, arch: Arch, mem: &mut impl TextMemory) -> Result<usize> {
        if self.is_installed() {
            return Err(TracerError::BreakpointAlreadyInstalled(self.addr));
        }

        let original = mem.read_word(self.addr)?;
        trace!("original word at {}: {original:016x}", self.addr);
        let patched = arch.patch(original);
        trace!("patched word at {}: {patched:016x}", self.addr);
        mem.write_word(self.addr, patched)?;
        self.saved_word = Some(original);

        Ok(arch.patch_width())
    }

    /// Puts the original bytes back at the site
    ///
    /// Only the patched bytes are taken from the saved word, the rest of the current word is
    /// kept, so a neighbouring breakpoint inside the same word survives.
    ///
    /// # Errors
    ///
    /// Fails if the breakpoint is not installed or if the memory cannot be accessed. If the
    /// write fails the breakpoint counts as still installed.
    pub fn restore(&mut self, arch: Arch, mem: &mut impl TextMemory) -> Result<()> {
        let Some(original) = self.saved_word else {
            return Err(TracerError::BreakpointNotInstalled(self.addr));
        };

        let current = mem.read_word(self.addr)?;
        let restored = arch.unpatch(current, original);
        trace!("restored word at {}: {restored:016x}", self.addr);
        mem.write_word(self.addr, restored)?;
        self.saved_word = None;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashMap;

    use super::*;

    /// Word-addressed fake of a process text, unaligned access reads across words
    #[derive(Default)]
    pub(crate) struct FakeText {
        pub(crate) bytes: HashMap<u64, u8>,
        pub(crate) fail_writes: bool,
    }

    impl FakeText {
        pub(crate) fn with_word(addr: u64, word: Word) -> Self {
            let mut text = Self::default();
            text.put(addr, word);
            text
        }

        pub(crate) fn put(&mut self, addr: u64, word: Word) {
            for (i, b) in word.to_le_bytes().into_iter().enumerate() {
                self.bytes.insert(addr + i as u64, b);
            }
        }

        pub(crate) fn get(&self, addr: u64) -> Word {
            let mut raw = [0u8; 8];
            for (i, b) in raw.iter_mut().enumerate() {
                *b = self.bytes.get(&(addr + i as u64)).copied().unwrap_or(0);
            }
            Word::from_le_bytes(raw)
        }
    }

    impl TextMemory for FakeText {
        fn read_word(&mut self, addr: Addr) -> Result<Word> {
            Ok(self.get(addr.u64()))
        }

        fn write_word(&mut self, addr: Addr, value: Word) -> Result<()> {
            if self.fail_writes {
                return Err(nix::Error::EIO.into());
            }
            self.put(addr.u64(), value);
            Ok(())
        }
    }

    const ORIGINAL: Word = 0x1122_3344_5566_7788;

    #[test]
    fn test_patch_encodings() {
        assert_eq!(Arch::X86_64.patch(ORIGINAL), 0x1122_3344_5566_77cc);
        assert_eq!(Arch::Aarch64.patch(ORIGINAL), 0x1122_3344_d420_0000);
        assert_eq!(Arch::X86_64.patch_width(), 1);
        assert_eq!(Arch::Aarch64.patch_width(), 4);
    }

    #[test]
    fn test_install_then_restore_round_trip() {
        for arch in [Arch::X86_64, Arch::Aarch64] {
            let mut text = FakeText::with_word(0x1000, ORIGINAL);
            let mut bp = Breakpoint::new(Addr::from(0x1000u64), "foo", None);

            let width = bp.install(arch, &mut text).unwrap();
            assert_eq!(width, arch.patch_width());
            assert_eq!(text.get(0x1000), arch.patch(ORIGINAL));
            assert_eq!(bp.saved_word(), Some(ORIGINAL));

            bp.restore(arch, &mut text).unwrap();
            assert_eq!(text.get(0x1000), ORIGINAL);
            assert!(!bp.is_installed());
        }
    }

    #[test]
    fn test_double_install_keeps_original() {
        let mut text = FakeText::with_word(0x1000, ORIGINAL);
        let mut bp = Breakpoint::new(Addr::from(0x1000u64), "foo", None);
        bp.install(Arch::X86_64, &mut text).unwrap();
        assert!(matches!(
            bp.install(Arch::X86_64, &mut text),
            Err(TracerError::BreakpointAlreadyInstalled(_))
        ));
        assert_eq!(bp.saved_word(), Some(ORIGINAL));

        bp.restore(Arch::X86_64, &mut text).unwrap();
        assert_eq!(text.get(0x1000), ORIGINAL);
    }

    #[test]
    fn test_reinstall_after_restore() {
        let mut text = FakeText::with_word(0x1000, ORIGINAL);
        let mut bp = Breakpoint::new(Addr::from(0x1000u64), "foo", None);
        for _ in 0..3 {
            bp.install(Arch::Aarch64, &mut text).unwrap();
            bp.restore(Arch::Aarch64, &mut text).unwrap();
        }
        assert_eq!(text.get(0x1000), ORIGINAL);
    }

    #[test]
    fn test_neighbouring_breakpoints_in_one_word() {
        let mut text = FakeText::with_word(0x1000, ORIGINAL);
        let mut first = Breakpoint::new(Addr::from(0x1000u64), "a", None);
        let mut second = Breakpoint::new(Addr::from(0x1002u64), "b", None);

        first.install(Arch::X86_64, &mut text).unwrap();
        second.install(Arch::X86_64, &mut text).unwrap();
        first.restore(Arch::X86_64, &mut text).unwrap();
        assert_eq!(text.bytes[&0x1002], 0xcc);
        second.restore(Arch::X86_64, &mut text).unwrap();
        assert_eq!(text.get(0x1000), ORIGINAL);
    }

    #[test]
    fn test_failed_write_saves_nothing() {
        let mut text = FakeText::with_word(0x1000, ORIGINAL);
        text.fail_writes = true;
        let mut bp = Breakpoint::new(Addr::from(0x1000u64), "foo", None);
        assert!(bp.install(Arch::X86_64, &mut text).is_err());
        assert!(!bp.is_installed());
        assert!(matches!(
            bp.restore(Arch::X86_64, &mut text),
            Err(TracerError::BreakpointNotInstalled(_))
        ));
    }

    #[test]
    fn test_null_redirect_is_none() {
        let bp = Breakpoint::new(Addr::from(0x1000u64), "foo", Some(Addr::NULL));
        assert_eq!(bp.redirect(), None);
    }
}

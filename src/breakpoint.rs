//! Software breakpoints, implemented by patching a trap instruction over tracee text.

use crate::error::{BreakpointErrorKind, Error, Result};

#[cfg(target_arch = "aarch64")]
use crate::aarch64 as arch;

#[cfg(target_arch = "x86_64")]
use crate::x86 as arch;

/// Word-granular access to the memory of a stopped tracee.
pub trait WordMemory {
    fn read_word(&mut self, addr: u64) -> Result<u64>;

    fn write_word(&mut self, addr: u64, word: u64) -> Result<()>;
}

/// A software breakpoint at a single address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Breakpoint {
    addr: u64,

    /// Word found at `addr` when the breakpoint was installed.
    saved: u64,

    installed: bool,
}

impl Breakpoint {
    pub fn new(addr: u64) -> Self {
        Self { addr, saved: 0, installed: false }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn saved_word(&self) -> u64 {
        self.saved
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Return `word` with its lowest-addressed instruction replaced by a trap.
    pub fn patch(word: u64) -> u64 {
        (word & !arch::TRAP_MASK) | arch::TRAP_INSTRUCTION
    }

    /// Save the word at `self.addr` and overwrite its first instruction with a trap.
    pub fn install(&mut self, mem: &mut impl WordMemory) -> Result<()> {
        if self.installed {
            return Err(self.error(BreakpointErrorKind::AlreadyInstalled, None));
        }

        let word = mem
            .read_word(self.addr)
            .map_err(|err| self.error(BreakpointErrorKind::Patch, Some(err)))?;

        mem.write_word(self.addr, Self::patch(word))
            .map_err(|err| self.error(BreakpointErrorKind::Patch, Some(err)))?;

        self.saved = word;
        self.installed = true;

        Ok(())
    }

    /// Restore the word saved by [`Breakpoint::install()`].
    pub fn uninstall(&mut self, mem: &mut impl WordMemory) -> Result<()> {
        if !self.installed {
            return Err(self.error(BreakpointErrorKind::NotInstalled, None));
        }

        mem.write_word(self.addr, self.saved)
            .map_err(|err| self.error(BreakpointErrorKind::Patch, Some(err)))?;

        self.installed = false;

        Ok(())
    }

    fn error(&self, kind: BreakpointErrorKind, source: Option<Error>) -> Error {
        Error::Breakpoint {
            addr: self.addr,
            kind,
            source: source.map(Box::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Default)]
    struct FakeMemory {
        words: BTreeMap<u64, u64>,
    }

    impl WordMemory for FakeMemory {
        fn read_word(&mut self, addr: u64) -> Result<u64> {
            match self.words.get(&addr) {
                Some(word) => Ok(*word),
                None => Err(Error::Internal(format!("unmapped: {addr:#x}"))),
            }
        }

        fn write_word(&mut self, addr: u64, word: u64) -> Result<()> {
            self.words.insert(addr, word);
            Ok(())
        }
    }

    const ADDR: u64 = 0x5555_5555_5248;
    const TEXT: u64 = 0x0123_4567_89ab_cdef;

    #[test]
    fn test_install_patches_only_first_instruction() -> Result<()> {
        let mut mem = FakeMemory::default();
        mem.words.insert(ADDR, TEXT);

        let mut bp = Breakpoint::new(ADDR);
        bp.install(&mut mem)?;

        let patched = mem.words[&ADDR];
        assert!(bp.is_installed());
        assert_eq!(bp.saved_word(), TEXT);
        assert_eq!(patched & arch::TRAP_MASK, arch::TRAP_INSTRUCTION);
        assert_eq!(patched & !arch::TRAP_MASK, TEXT & !arch::TRAP_MASK);

        Ok(())
    }

    #[test]
    fn test_uninstall_restores_original_word() -> Result<()> {
        let mut mem = FakeMemory::default();
        mem.words.insert(ADDR, TEXT);

        let mut bp = Breakpoint::new(ADDR);

        for _ in 0..3 {
            bp.install(&mut mem)?;
            bp.uninstall(&mut mem)?;
            assert_eq!(mem.words[&ADDR], TEXT);
        }

        assert!(!bp.is_installed());

        Ok(())
    }

    #[test]
    fn test_double_install_rejected() -> Result<()> {
        let mut mem = FakeMemory::default();
        mem.words.insert(ADDR, TEXT);

        let mut bp = Breakpoint::new(ADDR);
        bp.install(&mut mem)?;

        let err = bp.install(&mut mem).unwrap_err();
        assert!(matches!(err, Error::Breakpoint { kind: BreakpointErrorKind::AlreadyInstalled, .. }));

        // The saved word must still be the original text, not the trap.
        assert_eq!(bp.saved_word(), TEXT);

        Ok(())
    }

    #[test]
    fn test_uninstall_without_install_rejected() {
        let mut mem = FakeMemory::default();
        let mut bp = Breakpoint::new(ADDR);

        let err = bp.uninstall(&mut mem).unwrap_err();
        assert!(matches!(err, Error::Breakpoint { kind: BreakpointErrorKind::NotInstalled, .. }));
    }

    #[test]
    fn test_unreadable_address() {
        let mut mem = FakeMemory::default();
        let mut bp = Breakpoint::new(ADDR);

        let err = bp.install(&mut mem).unwrap_err();
        assert!(matches!(err, Error::Breakpoint { kind: BreakpointErrorKind::Patch, source: Some(_), .. }));
        assert!(!bp.is_installed());
    }
}

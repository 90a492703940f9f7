//! Enumeration of a tracee's virtual memory mappings.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::ptracer::Pid;

/// Access permissions of a mapping, as listed in `/proc/<pid>/maps`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
}

impl Permissions {
    /// Parse a `maps` permission string, such as `r-xp`.
    pub fn parse(flags: &str) -> Self {
        let flags = flags.as_bytes();
        let flag = |i: usize, c: u8| flags.get(i) == Some(&c);

        Self {
            read: flag(0, b'r'),
            write: flag(1, b'w'),
            execute: flag(2, b'x'),
            shared: flag(3, b's'),
        }
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.read { 'r' } else { '-' };
        let w = if self.write { 'w' } else { '-' };
        let x = if self.execute { 'x' } else { '-' };
        let s = if self.shared { 's' } else { 'p' };

        write!(f, "{r}{w}{x}{s}")
    }
}

/// One contiguous virtual address range of a tracee.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapping {
    pub start: u64,

    /// Exclusive.
    pub end: u64,

    pub permissions: Permissions,
    pub offset: u64,
    pub pathname: Option<PathBuf>,
}

impl MemoryMapping {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Returns `true` for the main thread's stack, listed as `[stack]`.
    pub fn is_stack(&self) -> bool {
        self.pathname.as_deref() == Some(Path::new("[stack]"))
    }

    /// Addresses of the words in this mapping, `stride` bytes apart.
    ///
    /// Yields nothing when `stride` is zero.
    pub fn words(&self, stride: u64) -> impl Iterator<Item = u64> {
        let count = if stride == 0 { 0 } else { self.len() / stride };
        let start = self.start;

        (0..count).map(move |i| start + i * stride)
    }
}

impl fmt::Display for MemoryMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}-{:#018x} {}", self.start, self.end, self.permissions)?;

        if let Some(path) = &self.pathname {
            write!(f, " {}", path.display())?;
        }

        Ok(())
    }
}

impl From<&proc_maps::MapRange> for MemoryMapping {
    fn from(range: &proc_maps::MapRange) -> Self {
        let start = range.start() as u64;
        let end = start + range.size() as u64;

        Self {
            start,
            end,
            permissions: Permissions::parse(&range.flags),
            offset: range.offset as u64,
            pathname: range.filename().map(|p| p.to_path_buf()),
        }
    }
}

/// Read the current memory mappings of `pid`, in ascending address order.
///
/// Mappings are read fresh from `/proc` on every call.
pub fn mappings(pid: Pid) -> Result<Vec<MemoryMapping>> {
    let ranges = proc_maps::get_process_maps(pid.as_raw())
        .map_err(|source| Error::Mappings { pid, source })?;

    let mut maps: Vec<MemoryMapping> = ranges.iter().map(MemoryMapping::from).collect();

    // The kernel already lists mappings in order, but don't rely on it.
    maps.sort_by_key(|m| m.start);

    Ok(maps)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_permissions() {
        let perms = Permissions::parse("r-xp");
        assert_eq!(perms, Permissions { read: true, write: false, execute: true, shared: false });
        assert_eq!(perms.to_string(), "r-xp");

        let perms = Permissions::parse("rw-s");
        assert_eq!(perms, Permissions { read: true, write: true, execute: false, shared: true });

        assert_eq!(Permissions::parse("---p"), Permissions::default());
        assert_eq!(Permissions::parse(""), Permissions::default());
    }

    #[test]
    fn test_words_strided() {
        let mapping = MemoryMapping {
            start: 0x1000,
            end: 0x1020,
            permissions: Permissions::parse("r--p"),
            offset: 0,
            pathname: None,
        };

        let words: Vec<_> = mapping.words(8).collect();
        assert_eq!(words, vec![0x1000, 0x1008, 0x1010, 0x1018]);
        assert_eq!(mapping.words(0).count(), 0);
        assert!(mapping.contains(0x101f));
        assert!(!mapping.contains(0x1020));
    }

    #[test]
    fn test_own_mappings_ordered() -> Result<()> {
        let pid = nix::unistd::getpid();
        let maps = mappings(pid)?;

        assert!(!maps.is_empty());

        for pair in maps.windows(2) {
            assert!(pair[0].start < pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }

        // Our own stack must be one of the mappings.
        let local = 0u64;
        let addr = &local as *const u64 as u64;
        assert!(maps.iter().any(|m| m.contains(addr)));

        assert_eq!(maps.iter().filter(|m| m.is_stack()).count(), 1);

        Ok(())
    }

    #[test]
    fn test_missing_process() {
        // PIDs are bounded by `pid_max`, which is at most 2^22.
        let pid = Pid::from_raw(i32::MAX);
        let err = mappings(pid).unwrap_err();

        assert!(matches!(err, Error::Mappings { .. }));
    }
}

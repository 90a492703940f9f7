//! Frame-pointer stack unwinding.
//!
//! Each frame record is a pair of words: the caller's frame pointer, then the return
//! address. Argument words are guessed to be the words between a frame record and the
//! caller's.

use std::fmt;

use crate::breakpoint::WordMemory;

const WORD: u64 = 8;

/// One unwound frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub ip: u64,

    /// Words above the frame record, in ascending address order. Unreadable words are 0.
    pub args: Vec<u64>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} (", self.ip)?;

        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg:#x}")?;
        }

        write!(f, ")")
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Backtrace {
    /// Innermost first.
    pub frames: Vec<Frame>,

    /// Unwinding stopped at the depth limit, not at the end of the chain.
    pub truncated: bool,
}

impl Backtrace {
    /// Walk the frame-pointer chain starting at `ip` and `fp`.
    ///
    /// Unwinding ends at the first unreadable frame record, at a return address of all
    /// ones, or after `max_depth` frames.
    pub fn unwind(
        mem: &mut impl WordMemory,
        mut ip: u64,
        mut fp: u64,
        max_args: usize,
        max_depth: usize,
    ) -> Self {
        let mut backtrace = Backtrace::default();

        loop {
            if backtrace.frames.len() >= max_depth {
                backtrace.truncated = true;
                break;
            }

            let next_fp = match mem.read_word(fp) {
                Ok(word) => word,
                Err(_) => break,
            };

            let n_args = if next_fp > fp {
                ((next_fp - fp) / WORD).saturating_sub(2) as usize
            } else {
                0
            };
            let n_args = n_args.min(max_args);

            let args = (0..n_args as u64)
                .map(|i| fp.wrapping_add(WORD * (2 + i)))
                .map(|addr| mem.read_word(addr).unwrap_or(0))
                .collect();

            backtrace.frames.push(Frame { ip, args });

            let next_ip = match mem.read_word(fp.wrapping_add(WORD)) {
                Ok(word) => word,
                Err(_) => break,
            };

            if next_ip == u64::MAX {
                break;
            }

            ip = next_ip;
            fp = next_fp;
        }

        backtrace
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "#{i} {frame}")?;
        }

        if self.truncated {
            writeln!(f, "...")?;
        }

        Ok(())
    }
}

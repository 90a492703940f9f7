//! Benchmark configuration: what to trace, how often, and how hard.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Mask selecting the page base of an address, for 4 KiB pages.
pub const PAGE_MASK: u64 = !0xfff;

/// Offset from the page of the attach-time instruction pointer to the default
/// breakpoint site.
pub const DEFAULT_BREAKPOINT_OFFSET: u64 = 0x248;

pub const DEFAULT_TRIAL_COUNT: usize = 30;
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_OUTPUT: &str = "timings_rust.csv";

/// How to choose the address of the breakpoint used by the breakpoint phase.
///
/// The address must hold an instruction that the tracee executes repeatedly, or the
/// breakpoint phase will block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakpointSite {
    /// Page base of the attach-time instruction pointer, plus an offset.
    PageOffset(u64),

    /// A fixed virtual address.
    Absolute(u64),

    /// The attach-time instruction pointer itself.
    AttachIp,
}

impl BreakpointSite {
    /// Resolve the breakpoint address, given the instruction pointer at attach.
    pub fn resolve(&self, ip: u64) -> u64 {
        match *self {
            BreakpointSite::PageOffset(offset) => (ip & PAGE_MASK).wrapping_add(offset),
            BreakpointSite::Absolute(addr) => addr,
            BreakpointSite::AttachIp => ip,
        }
    }
}

impl Default for BreakpointSite {
    fn default() -> Self {
        BreakpointSite::PageOffset(DEFAULT_BREAKPOINT_OFFSET)
    }
}

/// Iteration counts and constants of the measurement protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Workload {
    pub step_iterations: usize,
    pub breakpoint_iterations: usize,
    pub register_iterations: usize,
    pub memory_iterations: usize,
    pub search_iterations: usize,

    /// Added to the word at the stack pointer on each memory iteration.
    pub memory_increment: u64,

    /// Distance in bytes between words read by the memory search.
    pub search_stride: u64,

    /// Word value that ends a memory search.
    pub sentinel: u64,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            step_iterations: 1000,
            breakpoint_iterations: 1000,
            register_iterations: 1000,
            memory_iterations: 1000,
            search_iterations: 100,
            memory_increment: 5,
            search_stride: 8,
            sentinel: 6464,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub trial_count: usize,

    /// Executable spawned fresh for each trial.
    pub target_path: PathBuf,
    pub target_args: Vec<String>,

    /// Time to let a new target run before attaching to it.
    pub settle_delay: Duration,

    /// Result log path.
    pub output: PathBuf,

    pub breakpoint: BreakpointSite,

    /// Deadline for each wait on the tracee. `None` waits forever.
    pub wait_timeout: Option<Duration>,

    pub workload: Workload,
}

impl Config {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            trial_count: DEFAULT_TRIAL_COUNT,
            target_path: target_path.into(),
            target_args: vec![],
            settle_delay: DEFAULT_SETTLE_DELAY,
            output: PathBuf::from(DEFAULT_OUTPUT),
            breakpoint: BreakpointSite::default(),
            wait_timeout: None,
            workload: Workload::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.trial_count == 0 {
            return invalid("trial count must be at least 1");
        }

        if self.target_path.as_os_str().is_empty() {
            return invalid("target path is empty");
        }

        if self.workload.search_stride == 0 {
            return invalid("search stride must be nonzero");
        }

        if self.wait_timeout == Some(Duration::ZERO) {
            return invalid("wait timeout must be nonzero");
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(Error::InvalidConfig(msg.into()))
}

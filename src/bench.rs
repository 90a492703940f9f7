//! The instrumented phases, each a tight loop of one kind of ptrace request.

use nix::errno::Errno;
use tracing::{debug, trace, warn};

use crate::config::Workload;
use crate::error::{BreakpointErrorKind, Error, Result};
use crate::phase::Phase;
use crate::ptracer::Tracee;
use crate::timer::{PhaseTimer, PhaseTiming};

#[cfg(target_arch = "aarch64")]
use crate::aarch64 as arch;

#[cfg(target_arch = "x86_64")]
use crate::x86 as arch;

/// Progress made by the single-step phase.
///
/// Only the endpoints are compared, so a loop whose period divides the step count
/// reports no change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StepReport {
    pub steps: usize,

    /// Instruction pointer before and after the phase.
    pub ip_before: u64,
    pub ip_after: u64,
}

impl StepReport {
    pub fn ip_changed(&self) -> bool {
        self.ip_before != self.ip_after
    }

    fn check(&self, tracee: &Tracee) {
        if self.steps > 0 && !self.ip_changed() {
            warn!(pid = tracee.pid().as_raw(), ip = self.ip_after, "instruction pointer unchanged after stepping");
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SearchOutcome {
    /// Address of the first word equal to the sentinel.
    pub found: Option<u64>,

    pub words_read: u64,
    pub mappings_scanned: usize,

    /// Mappings not scanned to the end, because they are unreadable.
    pub mappings_skipped: usize,
}

/// Single-step the tracee `iterations` times.
pub fn single_step(tracee: &mut Tracee, iterations: usize) -> Result<()> {
    for _ in 0..iterations {
        tracee.step()?;
    }

    Ok(())
}

/// Hit a breakpoint at `addr`, `iterations` times.
///
/// Each iteration installs the breakpoint, continues to the trap, then uninstalls it and
/// rewinds the instruction pointer to `addr`.
pub fn breakpoints(tracee: &mut Tracee, addr: u64, iterations: usize) -> Result<()> {
    for _ in 0..iterations {
        tracee.insert_breakpoint(addr)?;
        tracee.cont()?;

        if tracee.find_breakpoint(addr).is_none() {
            let kind = BreakpointErrorKind::NotInstalled;
            return Err(Error::Breakpoint { addr, kind, source: None });
        }

        tracee.remove_breakpoint(addr, true)?;
    }

    Ok(())
}

/// Read, modify, and write back the full register set `iterations` times.
///
/// The tracee is never resumed, so the modification has no effect on its execution.
pub fn registers(tracee: &mut Tracee, iterations: usize) -> Result<()> {
    for _ in 0..iterations {
        let mut regs = tracee.registers()?;
        arch::shuffle(&mut regs);
        tracee.set_registers(regs)?;
    }

    Ok(())
}

/// Add `increment` to the word at `addr`, `iterations` times.
pub fn memory(tracee: &mut Tracee, addr: u64, increment: u64, iterations: usize) -> Result<()> {
    for _ in 0..iterations {
        let word = tracee.read_word(addr)?;
        tracee.write_word(addr, word.wrapping_add(increment))?;
    }

    Ok(())
}

/// Linearly scan all readable mappings for `sentinel`, `iterations` times.
///
/// Returns the outcome of the last scan.
pub fn search(tracee: &mut Tracee, stride: u64, sentinel: u64, iterations: usize) -> Result<SearchOutcome> {
    let mut outcome = SearchOutcome::default();

    for _ in 0..iterations {
        outcome = search_once(tracee, stride, sentinel)?;
    }

    Ok(outcome)
}

/// Scan the tracee's mappings in address order, stopping at the first word equal to
/// `sentinel`.
///
/// Mappings without read permission are skipped. A mapping that can't be read through
/// ptrace (such as `[vvar]`) is abandoned at the first failed read.
pub fn search_once(tracee: &mut Tracee, stride: u64, sentinel: u64) -> Result<SearchOutcome> {
    let mut outcome = SearchOutcome::default();

    for mapping in tracee.mappings()? {
        if !mapping.permissions.read {
            trace!(%mapping, "skipping unreadable mapping");
            outcome.mappings_skipped += 1;
            continue;
        }

        outcome.mappings_scanned += 1;

        for addr in mapping.words(stride) {
            let word = match tracee.read_word(addr) {
                Ok(word) => word,
                Err(Error::Memory { source: Errno::EIO, .. }) |
                Err(Error::Memory { source: Errno::EFAULT, .. }) => {
                    trace!(%mapping, addr, "abandoning mapping at unreadable word");
                    outcome.mappings_skipped += 1;
                    break;
                },
                Err(err) => return Err(err),
            };

            outcome.words_read += 1;

            if word == sentinel {
                outcome.found = Some(addr);
                return Ok(outcome);
            }
        }
    }

    Ok(outcome)
}

/// Run the timed phases after attach, marking each boundary on `timer`, then stop it.
///
/// The attach phase must already be marked.
pub fn run_phases(
    tracee: &mut Tracee,
    workload: &Workload,
    breakpoint: u64,
    mut timer: PhaseTimer,
) -> Result<PhaseTiming> {
    // Nothing has resumed the tracee since its attach-stop.
    let ip_before = tracee.cached_ip();

    tracee.enter(Phase::Stepping)?;
    single_step(tracee, workload.step_iterations)?;
    timer.mark(Phase::Stepping)?;

    let ip_after = timer.untimed(|| tracee.instruction_pointer())?;
    let report = StepReport { steps: workload.step_iterations, ip_before, ip_after };
    report.check(tracee);
    debug!(?report, "single-step phase done");

    tracee.enter(Phase::Breakpointing)?;
    breakpoints(tracee, breakpoint, workload.breakpoint_iterations)?;
    timer.mark(Phase::Breakpointing)?;

    tracee.enter(Phase::AccessingRegisters)?;
    registers(tracee, workload.register_iterations)?;
    timer.mark(Phase::AccessingRegisters)?;

    tracee.enter(Phase::AccessingMemory)?;
    let sp = tracee.cached_sp();
    memory(tracee, sp, workload.memory_increment, workload.memory_iterations)?;
    timer.mark(Phase::AccessingMemory)?;

    tracee.enter(Phase::Searching)?;
    let outcome = search(tracee, workload.search_stride, workload.sentinel, workload.search_iterations)?;
    let elapsed = timer.mark(Phase::Searching)?;
    debug!(?outcome, ?elapsed, "memory search phase done");

    timer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_report_compares_endpoints() {
        let moved = StepReport { steps: 1000, ip_before: 0x401000, ip_after: 0x401008 };
        assert!(moved.ip_changed());

        // A loop whose period divides the step count lands back where it started.
        let looped = StepReport { steps: 1000, ip_before: 0x401000, ip_after: 0x401000 };
        assert!(!looped.ip_changed());
    }
}

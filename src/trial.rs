//! Repeated trials, each against a freshly spawned target process.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal;
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use tracing::{debug, error, info, warn};

use crate::bench;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::phase::Phase;
use crate::ptracer::{Pid, Signal, Tracee};
use crate::record::ResultLog;
use crate::timer::{PhaseTimer, PhaseTiming};

/// A spawned, untraced target process.
///
/// The process is killed and reaped on [`Target::terminate()`] or drop, whichever comes
/// first, unless a [`Tracee`] reaped it already. Exactly one side reaps a PID: a
/// `Tracee` that terminates the target must do so through
/// [`Target::terminate_tracee()`], or report it with [`Target::mark_reaped()`].
#[derive(Debug)]
pub struct Target {
    path: PathBuf,
    pid: Pid,
    child: Option<Child>,
}

impl Target {
    pub fn spawn(path: impl AsRef<Path>, args: &[String]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let child = Command::new(&path)
            .args(args)
            .spawn()
            .map_err(|source| Error::Spawn { path: path.display().to_string(), source })?;

        let pid = Pid::from_raw(child.id() as i32);

        info!(pid = pid.as_raw(), path = %path.display(), "spawned target");

        Ok(Self { path, pid, child: Some(child) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns `true` once the target has been reaped, by us or by a [`Tracee`].
    pub fn is_terminated(&self) -> bool {
        self.child.is_none()
    }

    /// Attach to the target.
    ///
    /// If the target is observed to exit while attaching, it has already been reaped,
    /// and the target is marked as such.
    pub fn attach(&mut self, wait_timeout: Option<Duration>) -> Result<Tracee> {
        let res = Tracee::attach(self.pid, wait_timeout);

        if let Err(Error::TraceeExited { .. }) = &res {
            self.mark_reaped();
        }

        res
    }

    /// Kill and reap the target through the `Tracee` attached to it.
    ///
    /// On success, the PID is no longer ours, and the target is marked as reaped so it is
    /// never signalled again.
    pub fn terminate_tracee(&mut self, tracee: Tracee) -> Result<()> {
        if tracee.pid() != self.pid {
            let msg = format!("tracee = {} is not target = {}", tracee.pid(), self.pid);
            return Err(Error::Internal(msg));
        }

        tracee.terminate()?;
        self.mark_reaped();

        Ok(())
    }

    /// Forget the target without signalling it, because it was reaped elsewhere.
    pub fn mark_reaped(&mut self) {
        if self.child.take().is_some() {
            debug!(pid = self.pid.as_raw(), "target reaped by tracer");
        }
    }

    /// Kill and reap the target. Safe to call more than once.
    ///
    /// Does nothing once the target has been reaped, so a recycled PID is never
    /// signalled.
    pub fn terminate(&mut self) {
        // The `Child` itself is never waited on, so `std` never reaps behind our back.
        if self.child.take().is_none() {
            return;
        }

        let pid = self.pid;

        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {},
            Err(err) => warn!(pid = pid.as_raw(), %err, "could not kill target"),
        }

        loop {
            match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    debug!(pid = pid.as_raw(), "reaped target");
                    break;
                },
                // Stops of a target left traced, reported before the kill landed.
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    warn!(pid = pid.as_raw(), %err, "could not reap target");
                    break;
                },
            }
        }
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// A trial that did not run all of its phases.
#[derive(Debug)]
pub struct AbortedTrial {
    pub trial: usize,

    /// Phase the tracee was in when the trial failed.
    pub phase: Phase,

    pub error: Error,
}

/// Summary of a run of trials.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: usize,
    pub aborted: Vec<AbortedTrial>,
}

impl RunReport {
    /// Returns `true` if every trial ran to completion.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Attach to the running `target`, and drive it through every phase.
///
/// The tracee is always terminated before returning, even if a phase failed.
pub fn run_trial(target: &mut Target, config: &Config) -> std::result::Result<PhaseTiming, (Phase, Error)> {
    let timer = PhaseTimer::start();

    let mut tracee = target.attach(config.wait_timeout).map_err(|err| (Phase::Attached, err))?;

    let res = attached_trial(&mut tracee, config, timer);
    let phase = tracee.phase();

    if let Err(err) = target.terminate_tracee(tracee) {
        warn!(pid = target.pid().as_raw(), %err, "could not terminate tracee");
    }

    res.map_err(|err| (phase, err))
}

fn attached_trial(tracee: &mut Tracee, config: &Config, mut timer: PhaseTimer) -> Result<PhaseTiming> {
    let breakpoint = tracee.breakpoint_address(config.breakpoint);
    timer.mark(Phase::Attached)?;

    debug!(ip = tracee.cached_ip(), breakpoint, "resolved breakpoint address");

    bench::run_phases(tracee, &config.workload, breakpoint, timer)
}

/// Run `config.trial_count` trials, appending one row to `log` per completed trial.
///
/// Aborted trials are not retried, and are left out of the log. They are reported in the
/// returned [`RunReport`]. A target that can't be spawned aborts its trial in
/// [`Phase::Attached`], and the run goes on.
pub fn run<W: Write>(config: &Config, log: &mut ResultLog<W>) -> Result<RunReport> {
    config.validate()?;

    let mut report = RunReport::default();

    for trial in 0..config.trial_count {
        info!(trial, "starting trial");

        let res = Target::spawn(&config.target_path, &config.target_args)
            .map_err(|err| (Phase::Attached, err))
            .and_then(|mut target| {
                std::thread::sleep(config.settle_delay);

                let res = run_trial(&mut target, config);
                target.terminate();

                res
            });

        match res {
            Ok(timing) => {
                log.append(&timing)?;
                report.completed += 1;

                info!(trial, row = ?timing.row(), "finished trial");
            },
            Err((phase, error)) => {
                error!(trial, ?phase, %error, "aborted trial");
                report.aborted.push(AbortedTrial { trial, phase, error });
            },
        }
    }

    Ok(report)
}

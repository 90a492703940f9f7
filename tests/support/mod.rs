use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use ptbench::{Target, Tracee};

/// Deadline for any single wait, so a misbehaving test fails instead of hanging.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time to let a spawned target reach its busy loop.
pub const SETTLE: Duration = Duration::from_millis(200);

pub const SHELL: &str = "/bin/sh";

/// Arguments for a shell that spins in userspace, without making syscalls.
pub fn spin_args() -> Vec<String> {
    vec!["-c".into(), "while :; do :; done".into()]
}

/// Spawn a spinning shell, untraced.
pub fn spawn_spinner() -> Result<Target> {
    let target = Target::spawn(SHELL, &spin_args())?;
    sleep(SETTLE);
    Ok(target)
}

/// Spawn a spinning shell and attach to it.
pub fn attach_spinner() -> Result<(Target, Tracee)> {
    let mut target = spawn_spinner()?;
    let tracee = target.attach(Some(WAIT_TIMEOUT))?;
    Ok((target, tracee))
}

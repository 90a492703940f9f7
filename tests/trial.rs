use std::time::Duration;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use ptbench::record::HEADER;
use ptbench::trial::{self, run_trial};
use ptbench::{BreakpointSite, Config, Error, Phase, ResultLog, Target, Workload};

mod support;
use support::*;

/// A small but complete configuration against the spinning shell.
fn spinner_config(trials: usize) -> Config {
    let mut config = Config::new(SHELL);
    config.target_args = spin_args();
    config.trial_count = trials;
    config.settle_delay = SETTLE;
    config.breakpoint = BreakpointSite::AttachIp;
    config.wait_timeout = Some(WAIT_TIMEOUT);
    config.workload = Workload {
        step_iterations: 100,
        breakpoint_iterations: 100,
        register_iterations: 100,
        memory_iterations: 100,
        search_iterations: 1,
        ..Workload::default()
    };
    config
}

fn parse_rows(out: &str) -> Vec<Vec<u64>> {
    out.lines()
        .skip(1)
        .map(|line| line.split(',').map(|col| col.parse().unwrap()).collect())
        .collect()
}

#[test]
#[timeout(30000)]
fn test_one_trial_end_to_end() -> Result<()> {
    let config = spinner_config(1);

    let mut log = ResultLog::new(vec![])?;
    let report = trial::run(&config, &mut log)?;
    let out = String::from_utf8(log.finish()?)?;

    assert!(report.is_clean(), "aborted: {:?}", report.aborted);
    assert_eq!(report.completed, 1);

    let lines: Vec<_> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], HEADER);

    let rows = parse_rows(&out);
    assert_eq!(rows[0].len(), 7);

    let sum: u64 = rows[0][..6].iter().sum();
    assert_eq!(sum, rows[0][6]);

    Ok(())
}

#[test]
#[timeout(60000)]
fn test_row_per_trial() -> Result<()> {
    let config = spinner_config(3);

    let mut log = ResultLog::new(vec![])?;
    let report = trial::run(&config, &mut log)?;
    assert_eq!(log.rows(), 3);

    let out = String::from_utf8(log.finish()?)?;

    assert_eq!(report.completed, 3);
    assert_eq!(out.lines().count(), 4);

    for row in parse_rows(&out) {
        let sum: u64 = row[..6].iter().sum();
        assert_eq!(sum, row[6]);
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn test_aborted_trial_left_out_of_log() -> Result<()> {
    let mut config = spinner_config(2);

    // Nothing is mapped at the null page, so installing the breakpoint fails.
    config.breakpoint = BreakpointSite::Absolute(0);

    let mut log = ResultLog::new(vec![])?;
    let report = trial::run(&config, &mut log)?;
    let out = String::from_utf8(log.finish()?)?;

    assert_eq!(out, format!("{HEADER}\n"));
    assert_eq!(report.completed, 0);
    assert_eq!(report.aborted.len(), 2);
    assert!(!report.is_clean());

    for (i, aborted) in report.aborted.iter().enumerate() {
        assert_eq!(aborted.trial, i);
        assert_eq!(aborted.phase, Phase::Breakpointing);
        assert!(matches!(aborted.error, Error::Breakpoint { .. }));
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn test_single_trial_timing() -> Result<()> {
    let config = spinner_config(1);
    let mut target = Target::spawn(&config.target_path, &config.target_args)?;
    std::thread::sleep(config.settle_delay);

    let timing = run_trial(&mut target, &config).map_err(|(_, err)| err)?;
    assert!(target.is_terminated());

    let phases: Duration = Phase::TIMED.iter().filter_map(|p| timing.phase(*p)).sum();
    assert_eq!(phases, timing.total());
    assert!(timing.phase(Phase::Searching).is_some());

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_attach_failure_aborts_in_attach() -> Result<()> {
    let config = spinner_config(1);

    // An exited, unreaped target can't be attached to.
    let mut target = Target::spawn("/bin/true", &[])?;
    std::thread::sleep(SETTLE);

    let (phase, err) = run_trial(&mut target, &config).unwrap_err();

    assert_eq!(phase, Phase::Attached);
    assert!(matches!(err, Error::Attach { .. }));
    assert!(!target.is_terminated());

    target.terminate();
    assert!(target.is_terminated());

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_spawn_failure_aborts_trial_and_run_continues() -> Result<()> {
    let mut config = spinner_config(2);
    config.target_path = "/nonexistent/target".into();

    let mut log = ResultLog::new(vec![])?;
    let report = trial::run(&config, &mut log)?;
    let out = String::from_utf8(log.finish()?)?;

    assert_eq!(out, format!("{HEADER}\n"));
    assert_eq!(report.completed, 0);
    assert_eq!(report.aborted.len(), 2);

    for (i, aborted) in report.aborted.iter().enumerate() {
        assert_eq!(aborted.trial, i);
        assert_eq!(aborted.phase, Phase::Attached);
        assert!(matches!(aborted.error, Error::Spawn { .. }));
    }

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_missing_target() {
    let err = Target::spawn("/nonexistent/target", &[]).unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
}

#[test]
#[timeout(1000)]
fn test_invalid_config_runs_nothing() -> Result<()> {
    let mut config = spinner_config(1);
    config.trial_count = 0;

    let mut log = ResultLog::new(vec![])?;
    let err = trial::run(&config, &mut log).unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(log.rows(), 0);

    Ok(())
}

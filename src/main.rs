use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use structopt::StructOpt;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use ptbench::config::{BreakpointSite, Config, Workload};
use ptbench::{trial, ResultLog};

/// Time ptrace(2) primitives against a freshly spawned target, over many trials.
#[derive(StructOpt, Debug)]
#[structopt(name = "ptbench")]
struct Opt {
    /// Number of trials, each against a new target process.
    #[structopt(short = "n", long = "trials", default_value = "30")]
    trials: usize,

    /// Result log to create.
    #[structopt(short, long, default_value = "timings_rust.csv", parse(from_os_str))]
    output: PathBuf,

    /// Milliseconds to let the target run before attaching.
    #[structopt(long, default_value = "1000")]
    settle_ms: u64,

    /// Breakpoint at this offset from the page of the attach-time instruction pointer.
    #[structopt(long, parse(try_from_str = parse_hex))]
    breakpoint_offset: Option<u64>,

    /// Breakpoint at this absolute address.
    #[structopt(long, parse(try_from_str = parse_hex), conflicts_with = "breakpoint-offset", conflicts_with = "breakpoint-at-ip")]
    breakpoint_addr: Option<u64>,

    /// Breakpoint at the attach-time instruction pointer.
    #[structopt(long, conflicts_with = "breakpoint-offset")]
    breakpoint_at_ip: bool,

    /// Give up on a tracee that doesn't stop within this many milliseconds.
    #[structopt(long)]
    timeout_ms: Option<u64>,

    #[structopt(long, default_value = "1000")]
    steps: usize,

    #[structopt(long, default_value = "1000")]
    breakpoints: usize,

    #[structopt(long, default_value = "1000")]
    registers: usize,

    #[structopt(long, default_value = "1000")]
    memory: usize,

    #[structopt(long, default_value = "100")]
    searches: usize,

    /// Word value that ends a memory search.
    #[structopt(long, default_value = "6464")]
    sentinel: u64,

    /// Only log errors.
    #[structopt(short, long)]
    quiet: bool,

    /// Log more, repeat for more detail.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    /// Executable to spawn and trace.
    #[structopt(parse(from_os_str))]
    target: PathBuf,

    /// Arguments passed to the target.
    args: Vec<String>,
}

fn parse_hex(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x");
    Ok(u64::from_str_radix(s, 16)?)
}

impl Opt {
    fn config(&self) -> Config {
        let breakpoint = if let Some(addr) = self.breakpoint_addr {
            BreakpointSite::Absolute(addr)
        } else if self.breakpoint_at_ip {
            BreakpointSite::AttachIp
        } else if let Some(offset) = self.breakpoint_offset {
            BreakpointSite::PageOffset(offset)
        } else {
            BreakpointSite::default()
        };

        let workload = Workload {
            step_iterations: self.steps,
            breakpoint_iterations: self.breakpoints,
            register_iterations: self.registers,
            memory_iterations: self.memory,
            search_iterations: self.searches,
            sentinel: self.sentinel,
            ..Workload::default()
        };

        Config {
            trial_count: self.trials,
            target_path: self.target.clone(),
            target_args: self.args.clone(),
            settle_delay: Duration::from_millis(self.settle_ms),
            output: self.output.clone(),
            breakpoint,
            wait_timeout: self.timeout_ms.map(Duration::from_millis),
            workload,
        }
    }

    fn log_level(&self) -> Level {
        if self.quiet {
            return Level::ERROR;
        }

        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn init_tracing(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    init_tracing(opt.log_level());

    let config = opt.config();
    config.validate()?;

    let mut log = ResultLog::create(&config.output)?;
    let report = trial::run(&config, &mut log)?;
    log.finish()?;

    println!(
        "{} of {} trials completed, results in {}",
        report.completed,
        config.trial_count,
        config.output.display(),
    );

    if !report.is_clean() {
        for aborted in &report.aborted {
            eprintln!("trial {} aborted in {:?}: {}", aborted.trial, aborted.phase, aborted.error);
        }

        bail!("{} trials aborted, results are incomplete", report.aborted.len());
    }

    Ok(())
}

pub mod backtrace;
pub mod bench;
pub mod breakpoint;
pub mod config;
pub mod error;
pub mod maps;
pub mod phase;
pub mod ptracer;
pub mod record;
pub mod timer;
pub mod trial;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub mod x86;

pub use backtrace::{Backtrace, Frame};
pub use config::{BreakpointSite, Config, Workload};
pub use error::{Error, Result};
pub use phase::Phase;
pub use ptracer::{Pid, Registers, Restart, Signal, State, Tracee};
pub use record::ResultLog;
pub use timer::{PhaseTimer, PhaseTiming};
pub use trial::{RunReport, Target};

//! Attaching to a running process and driving it with blocking ptrace requests.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal,
        uio::{self, RemoteIoVec},
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, trace};

use crate::backtrace::Backtrace;
use crate::breakpoint::{Breakpoint, WordMemory};
use crate::config::BreakpointSite;
use crate::error::{internal_error, BreakpointErrorKind, Error, Result, ResultExt};
use crate::maps::{self, MemoryMapping};
use crate::phase::Phase;

#[cfg(target_arch = "aarch64")]
use crate::aarch64 as arch;

#[cfg(target_arch = "x86_64")]
use crate::x86 as arch;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Register state of a tracee.
pub use arch::Registers;

/// Restart requests, which resume stopped tracees.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Step,
    Continue,
}

/// Attach state of a [`Tracee`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    // Never attached, or released via `detach()`.
    Detached,

    // Attached, and stopped between requests.
    Attached,

    // Killed by us, or observed to have exited.
    Terminated,
}

const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// A process attached with `PTRACE_ATTACH`.
///
/// Every request blocks until the kernel responds. Waits block indefinitely, unless the
/// tracee was attached with a wait timeout.
///
/// A `Tracee` must be used from the thread that attached it, so it is `!Send`.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    state: State,
    phase: Phase,

    /// Instruction pointer at attach.
    ip: u64,

    /// Stack pointer at attach.
    sp: u64,

    breakpoints: BTreeMap<u64, Breakpoint>,

    /// Deadline for each wait, if any.
    wait_timeout: Option<Duration>,

    /// Initial delay between polls, when waiting with a deadline.
    poll_delay: Duration,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    /// Attach to the running process `pid`, and wait for its attach-stop.
    pub fn attach(pid: Pid, wait_timeout: Option<Duration>) -> Result<Self> {
        ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;

        info!(pid = pid.as_raw(), "attached to tracee");

        let mut tracee = Self {
            pid,
            state: State::Attached,
            phase: Phase::Attached,
            ip: 0,
            sp: 0,
            breakpoints: BTreeMap::new(),
            wait_timeout,
            poll_delay: DEFAULT_POLL_DELAY,
            _not_send: PhantomData,
        };

        // `PTRACE_ATTACH` delivers a `SIGSTOP`.
        tracee.wait_for(Signal::SIGSTOP)?;

        let regs = tracee.registers()?;
        tracee.ip = arch::instruction_pointer(&regs);
        tracee.sp = arch::stack_pointer(&regs);

        debug!(pid = pid.as_raw(), ip = tracee.ip, sp = tracee.sp, "tracee in attach-stop");

        Ok(tracee)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Instruction pointer observed at attach.
    pub fn cached_ip(&self) -> u64 {
        self.ip
    }

    /// Stack pointer observed at attach.
    pub fn cached_sp(&self) -> u64 {
        self.sp
    }

    /// Resolve `site` against the instruction pointer observed at attach.
    pub fn breakpoint_address(&self, site: BreakpointSite) -> u64 {
        site.resolve(self.ip)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    /// Return the initial tracee poll delay.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    /// Set the initial tracee poll delay.
    pub fn set_poll_delay(&mut self, poll_delay: Duration) {
        self.poll_delay = poll_delay;
    }

    /// Advance to the next phase of the trial.
    pub fn enter(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_enter(next) {
            return Err(Error::PhaseOrder { current: self.phase, next });
        }

        debug!(pid = self.pid.as_raw(), ?next, "entering phase");
        self.phase = next;

        Ok(())
    }

    /// Resume the stopped tracee, without waiting for it to stop again.
    pub fn restart(&mut self, restart: Restart) -> Result<()> {
        let pid = self.pid;

        let res = match restart {
            Restart::Step =>
                ptrace::step(pid, None::<Signal>),
            Restart::Continue =>
                ptrace::cont(pid, None::<Signal>),
        };

        res.died_if_esrch(pid)?;

        Ok(())
    }

    /// Execute one instruction, and wait for the trap that reports it.
    pub fn step(&mut self) -> Result<()> {
        self.restart(Restart::Step)?;
        self.wait_for_trap()
    }

    /// Resume the tracee, and wait for it to trap.
    pub fn cont(&mut self) -> Result<()> {
        self.restart(Restart::Continue)?;
        self.wait_for_trap()
    }

    /// Wait for the tracee to stop with a `SIGTRAP`.
    pub fn wait_for_trap(&mut self) -> Result<()> {
        self.wait_for(Signal::SIGTRAP)
    }

    fn wait_for(&mut self, expected: Signal) -> Result<()> {
        match self.wait()? {
            WaitStatus::Stopped(_pid, signal) if signal == expected => {
                Ok(())
            },
            WaitStatus::Stopped(pid, signal) |
            WaitStatus::PtraceEvent(pid, signal, _) => {
                Err(Error::UnexpectedSignal { pid, signal })
            },
            WaitStatus::Exited(pid, exit_code) => {
                self.state = State::Terminated;
                let status = format!("exited with code {exit_code}");
                Err(Error::TraceeExited { pid, status })
            },
            WaitStatus::Signaled(pid, signal, _core_dumped) => {
                self.state = State::Terminated;
                let status = format!("killed by {signal}");
                Err(Error::TraceeExited { pid, status })
            },
            // We never set `PTRACE_O_TRACESYSGOOD`.
            WaitStatus::PtraceSyscall(_) =>
                internal_error!("syscall-stop without `PTRACE_O_TRACESYSGOOD`"),
            // Assume `!WCONTINUED`, and that `wait()` never returns `StillAlive`.
            WaitStatus::Continued(_) |
            WaitStatus::StillAlive =>
                internal_error!("unreachable `wait()` status"),
        }
    }

    // Block until the tracee changes state, or the wait deadline passes.
    fn wait(&mut self) -> Result<WaitStatus> {
        let pid = self.pid;

        let timeout = match self.wait_timeout {
            Some(timeout) => timeout,
            None => return wait::waitpid(pid, Some(WaitPidFlag::__WALL)).died_if_esrch(pid),
        };

        let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;
        let start = Instant::now();
        let mut poll_delay = self.poll_delay;

        // Poll with exponential backoff, until the deadline.
        loop {
            match wait::waitpid(pid, Some(flags)).died_if_esrch(pid)? {
                WaitStatus::StillAlive => {
                    let elapsed = start.elapsed();

                    if elapsed >= timeout {
                        return Err(Error::Timeout { pid, elapsed });
                    }

                    trace!(pid = pid.as_raw(), ?poll_delay, "no tracee update, backing off");

                    std::thread::sleep(poll_delay.min(timeout - elapsed));

                    poll_delay = (poll_delay * 2).min(MAX_POLL_DELAY);
                },
                status => {
                    return Ok(status);
                },
            }
        }
    }

    pub fn registers(&self) -> Result<Registers> {
        let pid = self.pid;
        arch::registers(pid).map_err(|source| Error::Registers { pid, source })
    }

    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        let pid = self.pid;
        arch::set_registers(pid, regs).map_err(|source| Error::Registers { pid, source })
    }

    /// Read the current instruction pointer.
    pub fn instruction_pointer(&self) -> Result<u64> {
        let regs = self.registers()?;
        Ok(arch::instruction_pointer(&regs))
    }

    pub fn set_instruction_pointer(&mut self, ip: u64) -> Result<()> {
        let mut regs = self.registers()?;
        arch::set_instruction_pointer(&mut regs, ip);
        self.set_registers(regs)
    }

    /// Read the current stack pointer.
    pub fn stack_pointer(&self) -> Result<u64> {
        let regs = self.registers()?;
        Ok(arch::stack_pointer(&regs))
    }

    pub fn frame_pointer(&self) -> Result<u64> {
        let regs = self.registers()?;
        Ok(arch::frame_pointer(&regs))
    }

    /// Read a register by name, such as `rbp` or `x29`. Names are case-insensitive.
    pub fn register(&self, name: &str) -> Result<u64> {
        let mut regs = self.registers()?;
        let reg = lookup_register(&mut regs, name)?;

        Ok(*reg)
    }

    /// Write a register by name, leaving all others unchanged.
    pub fn set_register(&mut self, name: &str, value: u64) -> Result<()> {
        let mut regs = self.registers()?;
        *lookup_register(&mut regs, name)? = value;

        self.set_registers(regs)
    }

    /// Read one machine word with `PTRACE_PEEKDATA`.
    pub fn read_word(&self, addr: u64) -> Result<u64> {
        let pid = self.pid;
        let word = ptrace::read(pid, addr as ptrace::AddressType)
            .map_err(|source| Error::Memory { pid, addr, source })?;

        Ok(word as u64)
    }

    /// Write one machine word with `PTRACE_POKEDATA`.
    pub fn write_word(&mut self, addr: u64, word: u64) -> Result<()> {
        let pid = self.pid;
        ptrace::write(pid, addr as ptrace::AddressType, word as libc::c_long)
            .map_err(|source| Error::Memory { pid, addr, source })
    }

    /// Read `len` bytes at `addr` with a single `process_vm_readv()`.
    ///
    /// The result is short if the range runs into unmapped memory. Page protections
    /// apply, unlike for [`Tracee::read_word()`].
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let pid = self.pid;
        let mut buf = vec![0; len];

        if len == 0 {
            return Ok(buf);
        }

        let remote = [RemoteIoVec { base: addr as usize, len }];
        let mut local = [IoSliceMut::new(&mut buf)];

        let read = uio::process_vm_readv(pid, &mut local, &remote)
            .map_err(|source| Error::Memory { pid, addr, source })?;

        buf.truncate(read);

        Ok(buf)
    }

    /// Write `data` at `addr` with a single `process_vm_writev()`, returning the number
    /// of bytes written.
    ///
    /// Page protections apply, so this can't patch read-only text.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        let pid = self.pid;

        if data.is_empty() {
            return Ok(0);
        }

        let remote = [RemoteIoVec { base: addr as usize, len: data.len() }];
        let local = [IoSlice::new(data)];

        uio::process_vm_writev(pid, &local, &remote)
            .map_err(|source| Error::Memory { pid, addr, source })
    }

    /// Read a NUL-terminated string at `addr`, one word at a time.
    pub fn read_cstring(&self, addr: u64) -> Result<CString> {
        let mut bytes = vec![];
        let mut word_addr = addr;

        loop {
            let word = self.read_word(word_addr)?;

            for byte in word.to_le_bytes() {
                if byte == 0 {
                    // No interior NUL can have been pushed.
                    return CString::new(bytes).map_err(|err| Error::Internal(err.to_string()));
                }

                bytes.push(byte);
            }

            word_addr = word_addr.wrapping_add(8);
        }
    }

    /// Read the tracee's memory mappings, as of now.
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        maps::mappings(self.pid)
    }

    /// Find the mapping of the main thread's stack.
    pub fn find_stack(&self) -> Result<MemoryMapping> {
        self.mappings()?
            .into_iter()
            .find(MemoryMapping::is_stack)
            .ok_or(Error::NoStack { pid: self.pid })
    }

    /// Read `count` words upward from the current stack pointer.
    pub fn dump_stack(&self, count: usize) -> Result<Vec<u64>> {
        let sp = self.stack_pointer()?;

        (0..count as u64)
            .map(|i| self.read_word(sp.wrapping_add(8 * i)))
            .collect()
    }

    /// Unwind the stack by following frame pointers, from the current registers.
    ///
    /// Code built without frame pointers yields a short or empty backtrace.
    pub fn backtrace(&mut self, max_args: usize, max_depth: usize) -> Result<Backtrace> {
        let regs = self.registers()?;
        let ip = arch::instruction_pointer(&regs);
        let fp = arch::frame_pointer(&regs);

        let backtrace = Backtrace::unwind(self, ip, fp, max_args, max_depth);
        trace!(pid = self.pid.as_raw(), frames = backtrace.frames.len(), "unwound stack");

        Ok(backtrace)
    }

    /// Install a software breakpoint at `addr`.
    ///
    /// At most one breakpoint may be installed at an address.
    pub fn insert_breakpoint(&mut self, addr: u64) -> Result<()> {
        if self.breakpoints.contains_key(&addr) {
            let kind = BreakpointErrorKind::AlreadyInstalled;
            return Err(Error::Breakpoint { addr, kind, source: None });
        }

        let mut bp = Breakpoint::new(addr);
        bp.install(self)?;
        self.breakpoints.insert(addr, bp);

        Ok(())
    }

    pub fn find_breakpoint(&self, addr: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    /// Uninstall the breakpoint at `addr`, restoring the original instruction.
    ///
    /// If `reset_ip`, the instruction pointer is moved back to `addr`, so the restored
    /// instruction will be executed when the tracee resumes.
    pub fn remove_breakpoint(&mut self, addr: u64, reset_ip: bool) -> Result<Breakpoint> {
        let mut bp = match self.breakpoints.remove(&addr) {
            Some(bp) => bp,
            None => {
                let kind = BreakpointErrorKind::NotInstalled;
                return Err(Error::Breakpoint { addr, kind, source: None });
            },
        };

        if let Err(err) = bp.uninstall(self) {
            self.breakpoints.insert(addr, bp);
            return Err(err);
        }

        if reset_ip {
            self.set_instruction_pointer(addr)?;
        }

        Ok(bp)
    }

    /// Release the tracee, leaving it running.
    pub fn detach(mut self) -> Result<()> {
        let pid = self.pid;

        // Leave no traps behind in a live process.
        let installed: Vec<u64> = self.breakpoints.keys().copied().collect();
        for addr in installed {
            self.remove_breakpoint(addr, false)?;
        }

        ptrace::detach(pid, None::<Signal>).died_if_esrch(pid)?;
        self.state = State::Detached;

        info!(pid = pid.as_raw(), "detached from tracee");

        Ok(())
    }

    /// Kill the tracee with `SIGKILL` and reap it.
    ///
    /// Succeeds if the tracee has already exited, or was already reaped. Once this
    /// returns, the PID may be recycled, so a tracee spawned as a [`Target`] must be
    /// terminated via [`Target::terminate_tracee()`].
    ///
    /// [`Target`]: crate::trial::Target
    /// [`Target::terminate_tracee()`]: crate::trial::Target::terminate_tracee
    pub fn terminate(mut self) -> Result<()> {
        let pid = self.pid;

        if self.state != State::Terminated {
            match signal::kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {},
                Err(err) => return Err(err.into()),
            }
        }

        loop {
            match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(status) => {
                    // A stop reported before the kill was delivered.
                    trace!(pid = pid.as_raw(), ?status, "discarding stale status");
                    continue;
                },
                Err(Errno::ECHILD) => break,
                Err(err) => return Err(err.into()),
            }
        }

        self.state = State::Terminated;
        self.phase = Phase::Terminated;

        info!(pid = pid.as_raw(), "terminated tracee");

        Ok(())
    }
}

fn lookup_register<'a>(regs: &'a mut Registers, name: &str) -> Result<&'a mut u64> {
    let lower = name.to_ascii_lowercase();

    arch::register_mut(regs, &lower).ok_or_else(|| Error::UnknownRegister { name: name.to_owned() })
}

impl WordMemory for Tracee {
    fn read_word(&mut self, addr: u64) -> Result<u64> {
        Tracee::read_word(self, addr)
    }

    fn write_word(&mut self, addr: u64, word: u64) -> Result<()> {
        Tracee::write_word(self, addr, word)
    }
}

use nix::errno::Errno;

use crate::ptracer::Pid;

#[cfg(all(target_os = "android"))]
pub(crate) const PTRACE_GETREGSET: i32 = 0x4204;

#[cfg(all(not(target_os = "android")))]
pub(crate) const PTRACE_GETREGSET: u32 = 0x4204;

#[cfg(all(target_os = "android"))]
pub(crate) const PTRACE_SETREGSET: i32 = 0x4205;

#[cfg(all(not(target_os = "android")))]
pub(crate) const PTRACE_SETREGSET: u32 = 0x4205;

/// Linux constant defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: i32 = 0x1;

/// `brk #0`.
pub const TRAP_INSTRUCTION: u64 = 0xd420_0000;

/// Bits of a little-endian word covered by [`TRAP_INSTRUCTION`].
pub const TRAP_MASK: u64 = 0xffff_ffff;

/// Register state of a tracee.
pub type Registers = user_pt_regs;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64
}

pub(crate) fn registers(pid: Pid) -> nix::Result<Registers> {
    let mut data = std::mem::MaybeUninit::<Registers>::uninit();
    let mut rv = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: std::mem::size_of::<Registers>(),
    };

    let res = unsafe {
        libc::ptrace(PTRACE_GETREGSET, pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
    };

    Errno::result(res)?;

    Ok(unsafe { data.assume_init() })
}

pub(crate) fn set_registers(pid: Pid, mut regs: Registers) -> nix::Result<()> {
    let mut rv = libc::iovec {
        iov_base: &mut regs as *mut _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<Registers>(),
    };

    let res = unsafe {
        libc::ptrace(PTRACE_SETREGSET, pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
    };

    Errno::result(res)?;

    Ok(())
}

pub fn instruction_pointer(regs: &Registers) -> u64 {
    regs.pc
}

pub fn set_instruction_pointer(regs: &mut Registers, ip: u64) {
    regs.pc = ip;
}

pub fn stack_pointer(regs: &Registers) -> u64 {
    regs.sp
}

/// `x29`.
pub fn frame_pointer(regs: &Registers) -> u64 {
    regs.regs[29]
}

/// Look up a register by its lowercase name: `x0`-`x30`, `fp`, `lr`, `sp`, `pc`, or
/// `pstate`.
pub fn register_mut<'a>(regs: &'a mut Registers, name: &str) -> Option<&'a mut u64> {
    match name {
        "fp" => return Some(&mut regs.regs[29]),
        "lr" => return Some(&mut regs.regs[30]),
        "sp" => return Some(&mut regs.sp),
        "pc" => return Some(&mut regs.pc),
        "pstate" => return Some(&mut regs.pstate),
        _ => {},
    }

    let n: usize = name.strip_prefix('x')?.parse().ok()?;
    regs.regs.get_mut(n)
}

/// Copy `x1` into `x0`, and `sp` into `pc`.
pub fn shuffle(regs: &mut Registers) {
    regs.regs[0] = regs.regs[1];
    regs.pc = regs.sp;
}

use nix::sys::ptrace;

use crate::ptracer::Pid;

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

/// `int3`.
pub const TRAP_INSTRUCTION: u64 = 0xcc;

/// Bits of a little-endian word covered by [`TRAP_INSTRUCTION`].
pub const TRAP_MASK: u64 = 0xff;

pub(crate) fn registers(pid: Pid) -> nix::Result<Registers> {
    ptrace::getregs(pid)
}

pub(crate) fn set_registers(pid: Pid, regs: Registers) -> nix::Result<()> {
    ptrace::setregs(pid, regs)
}

pub fn instruction_pointer(regs: &Registers) -> u64 {
    regs.rip
}

pub fn set_instruction_pointer(regs: &mut Registers, ip: u64) {
    regs.rip = ip;
}

pub fn stack_pointer(regs: &Registers) -> u64 {
    regs.rsp
}

pub fn frame_pointer(regs: &Registers) -> u64 {
    regs.rbp
}

/// Look up a register by its lowercase name, such as `rax` or `fs_base`.
pub fn register_mut<'a>(regs: &'a mut Registers, name: &str) -> Option<&'a mut u64> {
    let reg = match name {
        "rax" => &mut regs.rax,
        "rbx" => &mut regs.rbx,
        "rcx" => &mut regs.rcx,
        "rdx" => &mut regs.rdx,
        "rsi" => &mut regs.rsi,
        "rdi" => &mut regs.rdi,
        "rbp" => &mut regs.rbp,
        "rsp" => &mut regs.rsp,
        "rip" => &mut regs.rip,
        "r8" => &mut regs.r8,
        "r9" => &mut regs.r9,
        "r10" => &mut regs.r10,
        "r11" => &mut regs.r11,
        "r12" => &mut regs.r12,
        "r13" => &mut regs.r13,
        "r14" => &mut regs.r14,
        "r15" => &mut regs.r15,
        "eflags" => &mut regs.eflags,
        "orig_rax" => &mut regs.orig_rax,
        "cs" => &mut regs.cs,
        "ss" => &mut regs.ss,
        "ds" => &mut regs.ds,
        "es" => &mut regs.es,
        "fs" => &mut regs.fs,
        "gs" => &mut regs.gs,
        "fs_base" => &mut regs.fs_base,
        "gs_base" => &mut regs.gs_base,
        _ => return None,
    };

    Some(reg)
}

/// Copy `rbx` into `rax`, and `rsp` into `rip`.
pub fn shuffle(regs: &mut Registers) {
    regs.rax = regs.rbx;
    regs.rip = regs.rsp;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_by_name() {
        let mut regs: Registers = unsafe { std::mem::zeroed() };
        regs.rbp = 0x7fff_0000;

        assert_eq!(register_mut(&mut regs, "rbp").copied(), Some(0x7fff_0000));
        assert!(register_mut(&mut regs, "xmm0").is_none());

        if let Some(r15) = register_mut(&mut regs, "r15") {
            *r15 = 15;
        }
        assert_eq!(regs.r15, 15);
    }
}

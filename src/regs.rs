//! # Register Accessor
//!
//! Reads and writes the instruction pointer and the integer argument registers of a stopped
//! process. x86-64 exposes its general purpose registers through `PTRACE_GETREGS`, AArch64
//! only through the `NT_PRSTATUS` register set of `PTRACE_GETREGSET`. Both hide behind
//! [`RegisterAccess`]; the tracer only ever sees [`NativeRegisters`].

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::addr::Addr;
use crate::breakpoint::Arch;
use crate::errors::Result;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fnroute can only trace x86_64 and aarch64 processes");

/// Number of integer argument registers of the C calling convention on both architectures
pub const ARGUMENT_REGISTERS: usize = 6;

/// Register access to one stopped process
pub trait RegisterAccess {
    /// Instruction set these registers belong to
    const ARCH: Arch;

    fn pid(&self) -> Pid;
    fn pc(&self) -> Result<Addr>;
    fn set_pc(&self, addr: Addr) -> Result<()>;
    /// The first integer arguments of a function that was just entered
    fn arguments(&self) -> Result<[u64; ARGUMENT_REGISTERS]>;
}

#[cfg(target_arch = "x86_64")]
pub type NativeRegisters = X86_64Registers;
#[cfg(target_arch = "aarch64")]
pub type NativeRegisters = Aarch64Registers;

#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct X86_64Registers(Pid);

#[cfg(target_arch = "x86_64")]
impl X86_64Registers {
    pub fn new(pid: Pid) -> Self {
        Self(pid)
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterAccess for X86_64Registers {
    const ARCH: Arch = Arch::X86_64;

    fn pid(&self) -> Pid {
        self.0
    }

    fn pc(&self) -> Result<Addr> {
        Ok(ptrace::getregs(self.0)?.rip.into())
    }

    fn set_pc(&self, addr: Addr) -> Result<()> {
        let mut regs = ptrace::getregs(self.0)?;
        regs.rip = addr.u64();
        ptrace::setregs(self.0, regs)?;
        Ok(())
    }

    fn arguments(&self) -> Result<[u64; ARGUMENT_REGISTERS]> {
        let regs = ptrace::getregs(self.0)?;
        Ok([regs.rdi, regs.rsi, regs.rdx, regs.rcx, regs.r8, regs.r9])
    }
}

#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy)]
pub struct Aarch64Registers(Pid);

#[cfg(target_arch = "aarch64")]
impl Aarch64Registers {
    pub fn new(pid: Pid) -> Self {
        Self(pid)
    }
}

#[cfg(target_arch = "aarch64")]
impl RegisterAccess for Aarch64Registers {
    const ARCH: Arch = Arch::Aarch64;

    fn pid(&self) -> Pid {
        self.0
    }

    fn pc(&self) -> Result<Addr> {
        let regs = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(self.0)?;
        Ok(regs.pc.into())
    }

    fn set_pc(&self, addr: Addr) -> Result<()> {
        let mut regs = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(self.0)?;
        regs.pc = addr.u64();
        ptrace::setregset::<ptrace::regset::NT_PRSTATUS>(self.0, regs)?;
        Ok(())
    }

    fn arguments(&self) -> Result<[u64; ARGUMENT_REGISTERS]> {
        let regs = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(self.0)?;
        let mut args = [0u64; ARGUMENT_REGISTERS];
        args.copy_from_slice(&regs.regs[..ARGUMENT_REGISTERS]);
        Ok(args)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_native_arch_matches_breakpoints() {
        assert_eq!(NativeRegisters::ARCH, Arch::NATIVE);
    }

    #[test]
    fn test_no_such_process() {
        // pid 0 is never a tracee of ours
        let regs = NativeRegisters::new(Pid::from_raw(0));
        assert!(regs.pc().is_err());
        assert!(regs.set_pc(Addr::from(0x1000u64)).is_err());
    }
}

//! # fnroute
//!
//! Redirects calls to named functions of a program to other functions, without rebuilding the
//! program. The program is started under `ptrace`, its ELF symbol table is read, and every
//! function named by the [routing table](routing::RoutingTable) gets a software breakpoint at
//! its entry point. When a breakpoint is hit the tracer either moves the instruction pointer to
//! the routed target function, or lets the original body run once and re-arms the site.
//!
//! The main entry point is [`tracer::Tracer`]. [`launcher`] picks between this strategy and the
//! loader-based one that shadows library functions through `LD_PRELOAD`.

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::addr::Addr;
use crate::errors::Result;

pub mod addr;
pub mod breakpoint;
pub mod consts;
pub mod errors;
pub mod launcher;
pub mod memorymap;
pub mod outcome;
pub mod regs;
pub mod routing;
pub mod session;
pub mod symbols;
pub mod tracer;

/// A machine word of the traced process
pub type Word = i64;

pub(crate) fn mem_write_word(pid: Pid, addr: Addr, value: Word) -> Result<()> {
    Ok(ptrace::write(pid, addr.into(), value)?)
}

pub(crate) fn mem_read_word(pid: Pid, addr: Addr) -> Result<Word> {
    Ok(ptrace::read(pid, addr.into())?)
}

//! # Trace Control Loop
//!
//! Starts the target program under `ptrace`, arms a breakpoint for every function the routing
//! table names and then drives the target until it exits.
//!
//! The loop is a small state machine. Each handler returns the next [`State`]:
//!
//! ```text
//! spawn -> initial stop -> arm breakpoints -> Running <-> HandlingTrap -> Terminated
//! ```
//!
//! A trap on a known site first restores the original instruction. A site with a redirect
//! target then gets its instruction pointer moved to the target and is re-armed right away,
//! so the original body never runs. A site without one is rewound, the original instruction is
//! single-stepped, and the site is re-armed, so the original body runs exactly once per call.
//!
//! Memory and registers are only touched while the target is stopped, which is the case in
//! every state except while blocked in `waitpid` after a resume.
//!
//! Note that a redirect target which calls the intercepted function again is redirected again,
//! the tracer does not tell those calls apart from the first one.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use nix::sys::personality::{self, Persona};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::addr::Addr;
use crate::breakpoint::{Breakpoint, ProcessText};
use crate::consts::{
    EXEC_FAILED_CODE, SI_KERNEL, TRAP_BRANCH, TRAP_BRKPT, TRAP_HWBKPT, TRAP_PERF, TRAP_TRACE,
    TRAP_UNK,
};
use crate::errors::{Result, TracerError};
use crate::memorymap::load_bias;
use crate::outcome::{Outcome, TraceReport};
use crate::regs::{NativeRegisters, RegisterAccess};
use crate::routing::RoutingTable;
use crate::session::{plan_breakpoints, TraceSession};
use crate::symbols::ElfImage;

/// Where the control loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Resume the target, delivering the signal if there is one, and wait for its next stop
    Running(Option<Signal>),
    /// The target stopped with `SIGTRAP`
    HandlingTrap,
    Terminated(Outcome),
}

/// Runs one program under trace with the routes of a [`RoutingTable`]
#[derive(Debug, Clone)]
pub struct Tracer<'table> {
    program: PathBuf,
    args: Vec<String>,
    table: &'table RoutingTable,
    disable_aslr: bool,
}

impl<'table> Tracer<'table> {
    pub fn build(program: impl AsRef<Path>, table: &'table RoutingTable) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            table,
            disable_aslr: false,
        }
    }

    /// Arguments passed to the program, without the program name
    #[must_use]
    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run the program with address space randomization turned off
    #[must_use]
    pub fn disable_aslr(mut self, disable: bool) -> Self {
        self.disable_aslr = disable;
        self
    }

    /// Finds the program like `execvp` would
    ///
    /// # Errors
    ///
    /// Fails if the program does not exist or is not a regular file.
    pub fn executable(&self) -> Result<PathBuf> {
        let path = which::which(&self.program).map_err(|_| {
            TracerError::ExecutableDoesNotExist(self.program.to_string_lossy().to_string())
        })?;
        if !path.is_file() {
            return Err(TracerError::ExecutableIsNotAFile(
                path.to_string_lossy().to_string(),
            ));
        }
        Ok(path)
    }

    /// Plans the breakpoints for the program without running it, at link-time addresses
    ///
    /// # Errors
    ///
    /// Fails if the program cannot be found or is not a supported ELF image.
    pub fn plan(&self) -> Result<Vec<Breakpoint>> {
        let image = ElfImage::read(self.executable()?)?;
        Ok(plan_breakpoints(&image.symbols, Addr::NULL, self.table))
    }

    /// Runs the program to completion under trace
    ///
    /// # Errors
    ///
    /// Only failures to start the program or to wait for it are errors. Everything that goes
    /// wrong with a single breakpoint is logged and the program keeps running.
    pub fn run(&self) -> Result<TraceReport> {
        let pid = self.spawn()?;
        if let Err(e) = self.await_initial_stop(pid) {
            error!("{e}");
            return Err(e);
        }

        let mut session = self.prepare_session(pid);
        session.install_all(&mut ProcessText(pid));

        let regs = NativeRegisters::new(pid);
        match self.control_loop(&mut session, &regs) {
            Ok(report) => Ok(report),
            Err(e) => {
                error!("lost control over the target: {e}");
                if let Err(e) = ptrace::kill(pid) {
                    warn!("could not kill the target: {e}");
                }
                Err(e)
            }
        }
    }

    fn spawn(&self) -> Result<Pid> {
        let path = self.executable()?;
        let cpath = CString::new(path.to_string_lossy().as_bytes())?;
        let mut argv = vec![CString::new(self.program.to_string_lossy().as_bytes())?];
        for arg in &self.args {
            argv.push(CString::new(arg.as_str())?);
        }

        info!("starting {} under trace", path.display());
        match unsafe { fork() } {
            Err(e) => {
                error!("could not start executable: {e}");
                Err(e.into())
            }
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => {
                if self.disable_aslr {
                    if let Ok(persona) = personality::get() {
                        let _ = personality::set(persona | Persona::ADDR_NO_RANDOMIZE);
                    }
                }
                if ptrace::traceme().is_ok() {
                    let _ = execv(&cpath, &argv);
                }
                unsafe { nix::libc::_exit(EXEC_FAILED_CODE) }
            }
        }
    }

    /// Waits for the trap that follows a successful `execv` in the child
    fn await_initial_stop(&self, pid: Pid) -> Result<()> {
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Exited(_, code) => return Err(TracerError::ExecFailed(code)),
            WaitStatus::Signaled(_, sig, _) => {
                return Err(TracerError::NoInitialStop(format!("killed by {sig}")))
            }
            other => warn!("target did not stop on SIGTRAP after exec: {other:?}"),
        }

        if let Err(e) = ptrace::setoptions(pid, Options::PTRACE_O_TRACEEXEC) {
            warn!("could not enable exec events: {e}");
        }
        Ok(())
    }

    /// Reads the symbols of the running image, computes its load bias and plans breakpoints
    fn prepare_session(&self, pid: Pid) -> TraceSession {
        let exe = match std::fs::read_link(format!("/proc/{pid}/exe")) {
            Ok(exe) => exe,
            Err(e) => {
                warn!("could not resolve the executable of {pid}: {e}");
                self.executable().unwrap_or_else(|_| self.program.clone())
            }
        };

        let image = ElfImage::read(&exe).unwrap_or_else(|e| {
            warn!("could not read {}: {e}", exe.display());
            ElfImage::default()
        });
        if image.symbols.is_empty() {
            warn!("No symbols found in executable (stripped?)");
        }

        let bias = load_bias(pid, &exe, image.position_independent).unwrap_or_else(|e| {
            warn!("could not compute the load bias: {e}");
            Addr::NULL
        });
        debug!("load bias of {} is {bias}", exe.display());

        let planned = plan_breakpoints(&image.symbols, bias, self.table);
        TraceSession::new(pid, NativeRegisters::ARCH, planned)
    }

    fn control_loop(
        &self,
        session: &mut TraceSession,
        regs: &impl RegisterAccess,
    ) -> Result<TraceReport> {
        let mut state = State::Running(None);
        loop {
            state = match state {
                State::Running(sig) => resume(session, sig)?,
                State::HandlingTrap => handle_trap(session, regs)?,
                State::Terminated(outcome) => {
                    info!("target {outcome}");
                    return Ok(session.report(outcome));
                }
            };
        }
    }
}

/// Continues the target and turns its next stop into the next state
fn resume(session: &mut TraceSession, sig: Option<Signal>) -> Result<State> {
    let pid = session.pid();
    if let Err(e) = ptrace::cont(pid, sig) {
        // the target may be gone already, waitpid tells
        warn!("could not continue the target: {e}");
    }

    let status = waitpid(pid, None)?;
    if let Some(outcome) = Outcome::from_wait_status(status) {
        return Ok(State::Terminated(outcome));
    }
    Ok(match status {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => State::HandlingTrap,
        WaitStatus::Stopped(_, sig) => {
            debug!("passing {sig} to the target");
            State::Running(Some(sig))
        }
        WaitStatus::PtraceEvent(_, _, event) if event == nix::libc::PTRACE_EVENT_EXEC => {
            warn!("target replaced its image, dropping all breakpoints");
            session.discard_breakpoints();
            State::Running(None)
        }
        other => {
            debug!("ignoring stop {other:?}");
            State::Running(None)
        }
    })
}

/// Decides what a `SIGTRAP` means and acts on it
fn handle_trap(session: &mut TraceSession, regs: &impl RegisterAccess) -> Result<State> {
    let pid = session.pid();
    let pc = match regs.pc() {
        Ok(pc) => pc,
        Err(e) => {
            warn!("could not read the instruction pointer: {e}");
            return Ok(State::Running(Some(Signal::SIGTRAP)));
        }
    };

    let Some(site) = session.site_for_pc(pc) else {
        warn!(
            "SIGTRAP at {pc} ({}) does not come from a breakpoint, passing it on",
            describe_trap(pid)
        );
        return Ok(State::Running(Some(Signal::SIGTRAP)));
    };

    if let Some(bp) = session.breakpoint(site) {
        match regs.arguments() {
            Ok(args) => info!("wrapper to {} {args:x?}", bp.symbol()),
            Err(_) => info!("wrapper to {}", bp.symbol()),
        }
    }

    let mut text = ProcessText(pid);
    match session.take_hit(site, &mut text) {
        Some(target) => {
            if let Err(e) = regs.set_pc(target) {
                warn!("could not redirect {site} to {target}: {e}");
                if let Err(e) = regs.set_pc(site) {
                    warn!("could not rewind to {site}: {e}");
                }
                return step_over(session, site);
            }
            session.rearm(site, &mut text);
            Ok(State::Running(None))
        }
        None => {
            if pc != site {
                if let Err(e) = regs.set_pc(site) {
                    warn!("could not rewind to {site}: {e}");
                }
            }
            step_over(session, site)
        }
    }
}

/// Executes the original instruction at `site` once and arms the site again
///
/// A signal that arrives instead of the step is held back and delivered on the next resume.
/// A fault raised by the instruction itself is delivered right away, stepping again would only
/// raise it again.
fn step_over(session: &mut TraceSession, site: Addr) -> Result<State> {
    let pid = session.pid();
    let mut pending = None;
    loop {
        if let Err(e) = ptrace::step(pid, None) {
            warn!("could not single-step over {site}: {e}");
        }
        let status = waitpid(pid, None)?;
        if let Some(outcome) = Outcome::from_wait_status(status) {
            return Ok(State::Terminated(outcome));
        }
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => break,
            WaitStatus::Stopped(_, sig) => {
                let si_code = ptrace::getsiginfo(pid).ok().map(|info| info.si_code);
                if is_instruction_fault(sig, si_code) {
                    debug!("the instruction at {site} raised {sig}");
                    if let Some(held) = pending {
                        // queue it again, the fault goes first
                        if let Err(e) = signal::kill(pid, held) {
                            warn!("could not re-raise {held}: {e}");
                        }
                    }
                    session.rearm(site, &mut ProcessText(pid));
                    return Ok(State::Running(Some(sig)));
                }
                debug!("{sig} arrived while stepping over {site}, holding it back");
                pending = Some(sig);
            }
            _ => break,
        }
    }

    session.rearm(site, &mut ProcessText(pid));
    Ok(State::Running(pending))
}

/// Whether a signal stop was caused by the instruction the target tried to execute
///
/// Such signals are raised by the kernel with a positive `si_code`. The same signals sent by
/// `kill` or `tgkill` carry a `si_code` of zero or below and can wait.
fn is_instruction_fault(sig: Signal, si_code: Option<i32>) -> bool {
    matches!(
        sig,
        Signal::SIGILL | Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGFPE
    ) && si_code.map_or(true, |code| code > 0)
}

/// Names the `si_code` of the pending `SIGTRAP`
fn describe_trap(pid: Pid) -> &'static str {
    match ptrace::getsiginfo(pid).map(|info| info.si_code) {
        Ok(SI_KERNEL) => "kernel",
        Ok(TRAP_BRKPT) => "breakpoint",
        Ok(TRAP_TRACE) => "trace trap",
        Ok(TRAP_BRANCH) => "branch trap",
        Ok(TRAP_HWBKPT) => "hardware breakpoint",
        Ok(TRAP_UNK) => "undiagnosed trap",
        Ok(TRAP_PERF) => "perf event",
        Ok(_) => "other",
        Err(_) => "unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_instruction_faults_are_not_held_back() {
        // ILL_ILLOPN, SEGV_MAPERR, SI_KERNEL
        assert!(is_instruction_fault(Signal::SIGILL, Some(2)));
        assert!(is_instruction_fault(Signal::SIGSEGV, Some(1)));
        assert!(is_instruction_fault(Signal::SIGSEGV, Some(SI_KERNEL)));
        assert!(is_instruction_fault(Signal::SIGFPE, None));
    }

    #[test]
    fn test_sent_signals_are_held_back() {
        // SI_USER, SI_TKILL
        assert!(!is_instruction_fault(Signal::SIGSEGV, Some(0)));
        assert!(!is_instruction_fault(Signal::SIGILL, Some(-6)));
        assert!(!is_instruction_fault(Signal::SIGUSR1, Some(1)));
        assert!(!is_instruction_fault(Signal::SIGALRM, None));
    }
}

//! # Launcher
//!
//! Chooses how calls get redirected. The default is active tracing with [`Tracer`]. The
//! alternative leaves all work to an interposer library loaded with `LD_PRELOAD`, which shadows
//! library functions through the dynamic loader's symbol resolution order and reads the same
//! mapping file through `WRAP_MAP`.
//!
//! [`Tracer`]: crate::tracer::Tracer

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::consts::{DEFAULT_MAP_PATH, DEFAULT_PRELOAD_LIB, ENV_MAP, ENV_MODE, ENV_PRELOAD};
use crate::errors::{Result, TracerError};
use crate::outcome::Outcome;

/// Interception strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Strategy {
    /// Trace the program and patch breakpoints into it
    #[default]
    Ptrace,
    /// Let the dynamic loader shadow functions with an interposer library
    Preload,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ptrace" => Ok(Strategy::Ptrace),
            "preload" => Ok(Strategy::Preload),
            other => Err(format!("unknown strategy {other:?}")),
        }
    }
}

impl Strategy {
    /// Reads `WRAP_MODE`; unset means tracing, anything unknown falls back to the loader
    pub fn from_env() -> Self {
        match std::env::var(ENV_MODE) {
            Err(_) => Strategy::Ptrace,
            Ok(mode) => mode.parse().unwrap_or_else(|e| {
                warn!("{e} in {ENV_MODE}, using preload");
                Strategy::Preload
            }),
        }
    }
}

/// The mapping file named by `WRAP_MAP`, or the default one
pub fn map_path_from_env() -> PathBuf {
    std::env::var_os(ENV_MAP)
        .map(PathBuf::from)
        .unwrap_or_else(|| DEFAULT_MAP_PATH.into())
}

/// The interposer library named by `WRAP_PRELOAD`, or the default one
pub fn preload_lib_from_env() -> PathBuf {
    std::env::var_os(ENV_PRELOAD)
        .map(PathBuf::from)
        .unwrap_or_else(|| DEFAULT_PRELOAD_LIB.into())
}

/// Runs `program` with `preload_lib` interposed and waits for it
///
/// # Errors
///
/// Fails if the program cannot be started or waited for.
pub fn run_preloaded(
    program: &Path,
    args: &[String],
    preload_lib: &Path,
    map: &Path,
) -> Result<Outcome> {
    info!(
        "starting {} with {} preloaded",
        program.display(),
        preload_lib.display()
    );
    let status = Command::new(program)
        .args(args)
        .env("LD_PRELOAD", preload_lib)
        .env(ENV_MAP, map)
        .status()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TracerError::ExecutableDoesNotExist(program.to_string_lossy().to_string())
            } else {
                e.into()
            }
        })?;
    debug!("preloaded target finished: {status}");

    if let Some(code) = status.code() {
        return Ok(Outcome::Exited(code));
    }
    match status.signal().map(Signal::try_from) {
        Some(Ok(sig)) => Ok(Outcome::Signaled(sig)),
        _ => Err(TracerError::UnexpectedStatus(status.to_string())),
    }
}

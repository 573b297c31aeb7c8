use thiserror::Error;

use crate::addr::Addr;

pub type Result<T> = std::result::Result<T, TracerError>;

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse object file: {0}")]
    Object(#[from] object::read::Error),
    #[error("Invalid routing pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
    #[error("Could not serialize: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Executable does not exist: {0}")]
    ExecutableDoesNotExist(String),
    #[error("Executable is not a file: {0}")]
    ExecutableIsNotAFile(String),
    #[error("Could not execute the target program (child exited with {0})")]
    ExecFailed(i32),
    #[error("Target did not stop after exec: {0}")]
    NoInitialStop(String),
    #[error("Unexpected process status: {0}")]
    UnexpectedStatus(String),
    #[error("Unsupported binary: {0}")]
    UnsupportedBinary(&'static str),
    #[error("Breakpoint at {0} is already installed")]
    BreakpointAlreadyInstalled(Addr),
    #[error("Breakpoint at {0} is not installed")]
    BreakpointNotInstalled(Addr),
}

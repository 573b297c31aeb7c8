//! Fixed values shared by the tracer, the launcher and the binaries.
//!
//! The `TRAP_*` codes are the `si_code` values the kernel attaches to a `SIGTRAP`. They are
//! deeply nested in the libc headers and not exported by nix.
//!
//! Source: <https://elixir.bootlin.com/linux/v6.13.1/source/include/uapi/asm-generic/siginfo.h#L227>

/// Environment variable naming the mapping file
pub const ENV_MAP: &str = "WRAP_MAP";
/// Environment variable selecting the interception strategy
pub const ENV_MODE: &str = "WRAP_MODE";
/// Environment variable naming the interposer library of the loader-based strategy
pub const ENV_PRELOAD: &str = "WRAP_PRELOAD";

/// Mapping file used when [`ENV_MAP`] is unset
pub const DEFAULT_MAP_PATH: &str = "./function_map.json";
/// Interposer library used when [`ENV_PRELOAD`] is unset
pub const DEFAULT_PRELOAD_LIB: &str = "./libwrap.so";

/// Exit code of the forked child when `execv` fails
pub const EXEC_FAILED_CODE: i32 = 127;
/// Exit code reported for failures of the tracer itself
pub const TRACER_FAILURE_CODE: i32 = 125;
/// Offset added to a signal number when the target dies from it
pub const SIGNAL_EXIT_OFFSET: i32 = 128;

/// Sent by the kernel from somewhere
pub const SI_KERNEL: i32 = 0x80;

// ---------------- SIGTRAP si_codes ---------------------------------------------------------------

/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
pub const TRAP_TRACE: i32 = 0x2;
/// Process taken branch trap
pub const TRAP_BRANCH: i32 = 0x3;
/// Hardware breakpoint/watchpoint
pub const TRAP_HWBKPT: i32 = 0x4;
/// Undiagnosed trap
pub const TRAP_UNK: i32 = 0x5;
/// Perf event with sigtrap=1
pub const TRAP_PERF: i32 = 0x6;

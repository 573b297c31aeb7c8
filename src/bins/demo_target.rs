//! A small program with a few plain C-ABI functions, run under the tracer by the integration
//! tests. The exit code tells which function bodies ran.
//!
//! * `add`: calls `demo_add(2, 3)` three times, exits with the sum (15)
//! * `route`: exits with `demo_bar(20)`, 21 normally and 40 if the call ends up in `demo_baz`
//! * `baz`: exits with `demo_baz(20)` (40)
//! * `fault`: calls `demo_fault`, whose first instruction is illegal
//! * `signals`: calls `demo_add(0, 1)` 200 times while another thread keeps sending `SIGUSR1`
//!   to the calling thread, exits with the sum (200)
//! * anything else: exits with 0

use std::hint::black_box;
use std::process::exit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::pthread::{pthread_kill, pthread_self};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static USR1_RECEIVED: AtomicUsize = AtomicUsize::new(0);

#[no_mangle]
#[inline(never)]
pub extern "C" fn demo_add(a: i32, b: i32) -> i32 {
    println!("demo_add({a}, {b}) called");
    a + b
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn demo_bar(x: i32) -> i32 {
    println!("demo_bar({x}) called");
    x + 1
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn demo_baz(x: i32) -> i32 {
    println!("demo_baz({x}) called");
    x * 2
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".globl demo_fault",
    ".type demo_fault, @function",
    "demo_fault:",
    "ud2",
    ".size demo_fault, . - demo_fault",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".globl demo_fault",
    ".type demo_fault, %function",
    "demo_fault:",
    "udf #0",
    ".size demo_fault, . - demo_fault",
);

extern "C" {
    fn demo_fault();
}

extern "C" fn on_usr1(_: nix::libc::c_int) {
    USR1_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

fn add_under_signals() -> i32 {
    let action = SigAction::new(
        SigHandler::Handler(on_usr1),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }.expect("could not install SIGUSR1 handler");

    let caller = pthread_self();
    let done = Arc::new(AtomicBool::new(false));
    let sender = {
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                let _ = pthread_kill(caller, Signal::SIGUSR1);
                thread::sleep(Duration::from_micros(50));
            }
        })
    };

    let sum = (0..200).map(|_| demo_add(black_box(0), black_box(1))).sum();
    done.store(true, Ordering::Relaxed);
    sender.join().expect("signal sender panicked");
    eprintln!("{} SIGUSR1 received", USR1_RECEIVED.load(Ordering::Relaxed));
    sum
}

fn main() {
    let scenario = std::env::args().nth(1).unwrap_or_default();
    let code = match scenario.as_str() {
        "add" => (0..3).map(|_| demo_add(black_box(2), black_box(3))).sum(),
        "route" => demo_bar(black_box(20)),
        "baz" => demo_baz(black_box(20)),
        "fault" => {
            unsafe { demo_fault() };
            0
        }
        "signals" => add_under_signals(),
        _ => 0,
    };
    exit(code);
}

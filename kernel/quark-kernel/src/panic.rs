//! Panic reporting and halt plumbing.
//!
//! The boot stub's `#[panic_handler]` lands in [`panic_common`], which
//! writes the report and backtrace to the boot console and then takes the
//! machine down.

use core::panic::PanicInfo;

use quark_core::arch::x86_64::instructions;
use quark_core::{kfatal, kprintln};

use crate::backtrace;

/// Halts this CPU permanently.
pub fn halt_self() -> ! {
    instructions::halt_loop()
}

/// Halts every CPU.
///
/// Intended to broadcast a halt IPI and wait for acknowledgement before
/// halting this CPU.
// TODO: broadcast the halt IPI once the IPI vector (IST5) is wired up.
pub fn halt_all() -> ! {
    halt_self()
}

/// Shared panic path: report, backtrace, halt everything.
pub fn panic_common(info: &PanicInfo<'_>) -> ! {
    kfatal!("kernel panic: {}", info.message());
    if let Some(location) = info.location() {
        kprintln!("  at {}:{}:{}", location.file(), location.line(), location.column());
    }

    backtrace::log_backtrace(None);

    halt_all()
}

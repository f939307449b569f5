//! The quark kernel proper: trap plane, virtual memory manager, backtraces,
//! and the boot handoff they hang off.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod backtrace;
pub mod boot;
pub mod config;
pub mod exceptions;
pub mod mm;
pub mod panic;

use quark_core::arch::x86_64::{cpu, instructions};
use quark_core::kinfo;

use crate::boot::BootInfoData;

/// Brings the kernel core up on the bootstrap processor and parks it.
///
/// Called by the boot stub once it has collected [`BootInfoData`] and is
/// running on a known-good stack. Order matters: the trap plane comes up
/// first so that any fault during memory bring-up gets a register dump
/// instead of a silent triple fault.
pub fn kernel_init(boot: &BootInfoData) -> ! {
    cpu::verify_required_features();
    // SAFETY: Ring 0, bringing up this processor.
    unsafe { cpu::enable_features() };

    // SAFETY: Called exactly once on the BSP, before interrupts.
    unsafe {
        arch::x86_64::gdt::init();
        arch::x86_64::idt::init();
    }

    mm::init(boot);

    if let Some(file) = &boot.kernel_file {
        // Text range for symbolication: the executable segments' span.
        let text: (u64, u64) = boot
            .kernel_segments
            .iter()
            .filter(|s| s.mode == quark_mm::vm_object::Mode::KernelRX)
            .fold((u64::MAX, 0), |(lo, hi), s| {
                (lo.min(s.virt.as_u64()), hi.max(s.virt.as_u64() + s.len))
            });
        if text.0 < text.1 {
            backtrace::init_symbols_from_image(file, text.0, text.1);
        }
    }

    arch::x86_64::interrupts::dispatch::set_page_fault_sink(mm::vmm::handle_fault);

    kinfo!(
        "core online: {} usable memory regions, aperture live",
        boot.usable_regions().count()
    );

    // Nothing above the core exists yet to schedule.
    instructions::halt_loop()
}

//! Kernel memory bring-up and the VM manager.

pub mod vmm;

use quark_core::addr::PhysAddr;
use quark_core::kdebug;
use quark_mm::{FRAME_SIZE, pmm};

use crate::boot::BootInfoData;

/// Physical addresses below this are reachable through the bootloader's
/// identity map before the aperture is live.
const EARLY_BOOT_LIMIT: u64 = 0x1_0000_0000;

/// Brings up physical memory and the kernel address space.
///
/// Regions below 4 GiB seed the allocator first (their bitmaps must be
/// written through the boot identity map); everything higher is added after
/// the aperture is live and can reach it.
pub fn init(boot: &BootInfoData) {
    pmm::init(FRAME_SIZE, &[], 0);

    for region in boot.usable_regions() {
        let start = region.start.align_up(FRAME_SIZE).as_u64();
        let end = (region.start.as_u64() + region.size) & !(FRAME_SIZE - 1);
        if start >= end {
            continue;
        }
        let early_end = end.min(EARLY_BOOT_LIMIT);
        if start < early_end {
            // SAFETY: The bootloader reported this range as usable RAM.
            let result = unsafe {
                pmm::add_region(PhysAddr::new(start), early_end - start, 0)
            };
            if let Err(err) = result {
                kdebug!("skipping boot region {start:#x}: {err}");
            }
        }
    }

    vmm::init(boot);

    // High memory becomes reachable once the aperture is live.
    for region in boot.usable_regions() {
        let start = region.start.align_up(FRAME_SIZE).as_u64().max(EARLY_BOOT_LIMIT);
        let end = (region.start.as_u64() + region.size) & !(FRAME_SIZE - 1);
        if start >= end {
            continue;
        }
        // SAFETY: The bootloader reported this range as usable RAM.
        let result = unsafe { pmm::add_region(PhysAddr::new(start), end - start, 0) };
        if let Err(err) = result {
            kdebug!("skipping boot region {start:#x}: {err}");
        }
    }
}

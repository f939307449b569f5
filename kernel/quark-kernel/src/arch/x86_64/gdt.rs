//! BSP GDT and TSS bring-up.
//!
//! The table layout is fixed (see `quark_core`'s GDT module); this module
//! owns the static instances for the bootstrap processor: the 64-slot table,
//! one TSS, and the seven 4 KiB interrupt stacks its IST entries point at.

use core::cell::UnsafeCell;

use quark_core::arch::x86_64::instructions::segmentation::{
    load_ds, load_es, load_fs, load_gs, load_ss, load_tss, set_cs,
};
use quark_core::arch::x86_64::structures::gdt::{
    Descriptor, Gdt, KERNEL_CODE_SELECTOR, KERNEL_CODE_SLOT, KERNEL_DATA_SELECTOR,
    KERNEL_DATA_SLOT, SegmentSelector, TaskStateSegment, USER_CODE32_SLOT, USER_CODE64_SLOT,
    USER_DATA_SLOT, tss_selector,
};
use quark_core::kdebug;
use quark_core::sync::LazyLock;

use crate::config::IST_STACK_SIZE;

/// One interrupt stack. Stacks grow down; the IST entry holds the top.
#[repr(C, align(16))]
struct IstStack([u8; IST_STACK_SIZE]);

/// The BSP's seven interrupt stacks. Referenced only by address; the CPU
/// writes into them on stack switches.
static BSP_IST_STACKS: [IstStack; 7] = [const { IstStack([0; IST_STACK_SIZE]) }; 7];

/// `Sync` wrapper for the TSS.
///
/// Software only writes the TSS through [`set_kernel_stack`], with interrupts
/// disabled; the CPU reads it on ring transitions, which cannot race those
/// writes.
#[repr(transparent)]
struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: See the type-level invariant above.
unsafe impl<T> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    fn get(&self) -> *mut T {
        self.0.get()
    }
}

/// The BSP TSS: zeroed, I/O bitmap disabled, IST1..IST7 pointing at the
/// tops of the seven interrupt stacks.
static BSP_TSS: LazyLock<SyncUnsafeCell<TaskStateSegment>> = LazyLock::new(|| {
    let mut tss = TaskStateSegment::new();
    for (i, stack) in BSP_IST_STACKS.iter().enumerate() {
        let top = stack as *const IstStack as u64 + IST_STACK_SIZE as u64;
        tss.interrupt_stack_table[i] = top;
    }
    SyncUnsafeCell::new(tss)
});

/// The BSP GDT: null, the five segments, then the BSP TSS in the first TSS
/// slot pair.
static BSP_GDT: LazyLock<Gdt> = LazyLock::new(|| {
    let mut gdt = Gdt::new();
    gdt.set_descriptor(KERNEL_CODE_SLOT, Descriptor::kernel_code_segment());
    gdt.set_descriptor(KERNEL_DATA_SLOT, Descriptor::kernel_data_segment());
    gdt.set_descriptor(USER_CODE32_SLOT, Descriptor::user_code32_segment());
    gdt.set_descriptor(USER_CODE64_SLOT, Descriptor::user_code64_segment());
    gdt.set_descriptor(USER_DATA_SLOT, Descriptor::user_data_segment());
    // SAFETY: The TSS is fully built by its own LazyLock initializer; the
    // descriptor only records its address.
    gdt.install_tss(0, unsafe { &*BSP_TSS.get() });
    gdt
});

/// Loads the BSP GDT, reloads all segment registers, and activates the TSS.
///
/// # Safety
///
/// Must run exactly once, on the BSP, with interrupts disabled.
pub unsafe fn init() {
    let gdt: &'static Gdt = &BSP_GDT;

    // SAFETY: The table was just built with valid descriptors; the selector
    // reloads match its fixed layout.
    unsafe {
        gdt.load(1);
        set_cs(KERNEL_CODE_SELECTOR);
        load_ds(KERNEL_DATA_SELECTOR);
        load_ss(KERNEL_DATA_SELECTOR);
        load_es(SegmentSelector::new(0, 0));
        load_fs(SegmentSelector::new(0, 0));
        load_gs(SegmentSelector::new(0, 0));
        load_tss(tss_selector(0));
    }

    kdebug!("GDT loaded, TSS active with 7 interrupt stacks");
}

/// Points RSP0 (the ring-0 entry stack) at `rsp`.
///
/// The CPU reads the TSS from memory on each ring transition, so the update
/// takes effect immediately without reloading TR.
///
/// # Safety
///
/// `rsp` must be the top of a valid, mapped kernel stack, and interrupts
/// must be disabled while the running task's stack is being switched.
pub unsafe fn set_kernel_stack(rsp: u64) {
    // SAFETY: Single writer by contract (interrupts disabled); the CPU's
    // reads cannot tear against an aligned u64 store.
    unsafe {
        (*BSP_TSS.get()).privilege_stack_table[0] = rsp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quark_core::arch::x86_64::structures::gdt::{FIRST_TSS_SLOT, GDT_SLOTS};

    #[test]
    fn bsp_tss_ist_entries_cover_all_seven_stacks() {
        // SAFETY: Tests never race the (unused) kernel-stack writer.
        let tss = unsafe { *BSP_TSS.get() };
        let ist = { tss.interrupt_stack_table };

        for (i, &top) in ist.iter().enumerate() {
            let base = &BSP_IST_STACKS[i] as *const IstStack as u64;
            assert_eq!(top, base + IST_STACK_SIZE as u64, "IST{}", i + 1);
            assert_eq!(top % 16, 0, "IST{} top misaligned", i + 1);
        }

        // The seven stacks are distinct.
        for i in 0..7 {
            for j in i + 1..7 {
                assert_ne!(ist[i], ist[j]);
            }
        }

        let iomap = { tss.iomap_base };
        assert_eq!(iomap as usize, core::mem::size_of::<TaskStateSegment>() - 1);

        // RSP0 updates land in the live TSS. Kept in this test body so no
        // parallel test reads the TSS while it is written.
        // SAFETY: No concurrent ring transitions on the host.
        unsafe { set_kernel_stack(0xFFFF_8000_1234_0000) };
        let tss = unsafe { *BSP_TSS.get() };
        let rsp0 = { tss.privilege_stack_table[0] };
        assert_eq!(rsp0, 0xFFFF_8000_1234_0000);
    }

    #[test]
    fn bsp_gdt_layout() {
        let gdt: &Gdt = &BSP_GDT;

        assert_eq!(gdt.slot(0), 0, "null descriptor");
        for slot in [
            KERNEL_CODE_SLOT,
            KERNEL_DATA_SLOT,
            USER_CODE32_SLOT,
            USER_CODE64_SLOT,
            USER_DATA_SLOT,
            FIRST_TSS_SLOT,
        ] {
            assert_ne!(gdt.slot(slot), 0, "slot {slot} empty");
        }
        // Nothing beyond the TSS pair.
        for slot in FIRST_TSS_SLOT + 2..GDT_SLOTS {
            assert_eq!(gdt.slot(slot), 0, "slot {slot} unexpectedly used");
        }
    }

}

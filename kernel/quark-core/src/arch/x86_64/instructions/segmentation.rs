//! Segment register loads and reads.

use crate::arch::x86_64::structures::gdt::SegmentSelector;

/// Reloads CS via a far return.
///
/// # Safety
///
/// `selector` must reference a valid 64-bit code segment in the loaded GDT.
#[inline]
pub unsafe fn set_cs(selector: SegmentSelector) {
    unsafe {
        core::arch::asm!(
            "push {sel:r}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            sel = in(reg) u64::from(selector.as_u16()),
            tmp = lateout(reg) _,
            options(preserves_flags),
        );
    }
}

macro_rules! segment_load {
    ($(#[$doc:meta])* $name:ident, $reg:literal) => {
        $(#[$doc])*
        ///
        /// # Safety
        ///
        /// `selector` must reference a valid data segment descriptor in the
        /// loaded GDT, or be the null selector.
        #[inline]
        pub unsafe fn $name(selector: SegmentSelector) {
            unsafe {
                core::arch::asm!(
                    concat!("mov ", $reg, ", {:x}"),
                    in(reg) selector.as_u16(),
                    options(nostack, preserves_flags),
                );
            }
        }
    };
}

segment_load!(
    /// Loads DS.
    load_ds, "ds");
segment_load!(
    /// Loads SS.
    load_ss, "ss");
segment_load!(
    /// Loads ES.
    load_es, "es");
segment_load!(
    /// Loads FS.
    load_fs, "fs");
segment_load!(
    /// Loads GS.
    load_gs, "gs");

/// Loads the task register with a TSS selector (LTR).
///
/// # Safety
///
/// `selector` must reference a valid, available 64-bit TSS descriptor in the
/// loaded GDT.
#[inline]
pub unsafe fn load_tss(selector: SegmentSelector) {
    unsafe {
        core::arch::asm!(
            "ltr {:x}",
            in(reg) selector.as_u16(),
            options(nostack, preserves_flags),
        );
    }
}

/// Reads CS.
#[inline]
pub fn read_cs() -> SegmentSelector {
    let val: u16;
    // SAFETY: Reading a segment register has no side effects.
    unsafe {
        core::arch::asm!("mov {:x}, cs", out(reg) val, options(nomem, nostack, preserves_flags));
    }
    SegmentSelector::from_raw(val)
}

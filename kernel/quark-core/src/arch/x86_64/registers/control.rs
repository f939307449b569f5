//! Control registers.
//!
//! Only the two the core needs: CR2 (fault address) and CR3 (page table
//! root).

use crate::addr::PhysAddr;

/// CR2: linear address of the most recent page fault.
pub struct Cr2;

impl Cr2 {
    /// Reads the faulting linear address.
    ///
    /// Returned raw because the faulting address may be non-canonical.
    #[inline]
    pub fn read() -> u64 {
        let val: u64;
        // SAFETY: Reading CR2 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        val
    }
}

/// CR3: physical address of the active PML4.
pub struct Cr3;

/// Mask selecting the PML4 base address inside CR3 (drops PCD/PWT and PCID
/// bits).
const CR3_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl Cr3 {
    /// Reads the active page-table root.
    #[inline]
    pub fn read() -> PhysAddr {
        let val: u64;
        // SAFETY: Reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        PhysAddr::new_truncate(val & CR3_ADDR_MASK)
    }

    /// Loads a new page-table root, switching address spaces and flushing
    /// all non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid PML4 whose mappings
    /// cover all code and data the CPU is currently using.
    #[inline]
    pub unsafe fn write(root: PhysAddr) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) root.as_u64(),
                options(nostack, preserves_flags),
            );
        }
    }
}

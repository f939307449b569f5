//! Page-table entry encoding for 4-level amd64 paging.

use crate::addr::PhysAddr;

/// Physical address bits of a table entry (bits 12..51).
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present.
        const PRESENT       = 1 << 0;
        /// Writes allowed.
        const WRITABLE      = 1 << 1;
        /// Ring-3 access allowed.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on first access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on first write.
        const DIRTY         = 1 << 6;
        /// PS bit: 1 GiB page in a PDPT entry, 2 MiB page in a PD entry.
        const HUGE_PAGE     = 1 << 7;
        /// PAT selector bit of a 4 KiB leaf (same position as PS).
        const PAT           = 1 << 7;
        /// Survives CR3 reloads while CR4.PGE is set.
        const GLOBAL        = 1 << 8;
        /// Instruction fetches fault. Only valid once EFER.NXE is enabled;
        /// reserved-must-be-zero otherwise.
        const NO_EXECUTE    = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Error code pushed by the CPU on a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// 1 = protection violation, 0 = page not present.
        const PRESENT           = 1 << 0;
        /// The faulting access was a write.
        const WRITE             = 1 << 1;
        /// The fault happened in user mode.
        const USER              = 1 << 2;
        /// A reserved bit was set in a paging structure.
        const RESERVED_WRITE    = 1 << 3;
        /// The fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// A single 64-bit page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// A not-present entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds an entry from a raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Builds an entry from a frame address and flags.
    pub const fn new(addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns the raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address portion.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new_truncate(self.0 & ADDR_MASK)
    }

    /// Returns the flags portion.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.address().as_u64(), 0);
    }

    #[test]
    fn entry_roundtrip() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        let entry = PageTableEntry::new(PhysAddr::new(0x1234_5000), flags);
        assert!(entry.is_present());
        assert_eq!(entry.address().as_u64(), 0x1234_5000);
        assert_eq!(entry.flags(), flags);
    }

    #[test]
    fn address_and_flags_disjoint() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x000F_FFFF_FFFF_F000),
            PageTableFlags::PRESENT | PageTableFlags::GLOBAL,
        );
        assert_eq!(entry.address().as_u64() & !ADDR_MASK, 0);
        assert_eq!(entry.flags().bits() & ADDR_MASK, 0);
    }

    #[test]
    fn addr_mask_covers_bits_12_to_51() {
        for bit in 0..64 {
            let expected = (12..52).contains(&bit);
            assert_eq!((ADDR_MASK >> bit) & 1 == 1, expected, "bit {bit}");
        }
    }

    #[test]
    fn huge_and_pat_share_bit_7() {
        assert_eq!(PageTableFlags::HUGE_PAGE.bits(), PageTableFlags::PAT.bits());
        assert_eq!(PageTableFlags::HUGE_PAGE.bits(), 1 << 7);
    }

    #[test]
    fn fault_code_decoding() {
        let code = PageFaultErrorCode::from_bits_truncate(0b00110);
        assert!(code.contains(PageFaultErrorCode::WRITE));
        assert!(code.contains(PageFaultErrorCode::USER));
        assert!(!code.contains(PageFaultErrorCode::PRESENT));
    }

}

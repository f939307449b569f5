//! Bootloader-agnostic boot information.
//!
//! The boot stub (stivale2 today) converts whatever its protocol hands over
//! into [`BootInfoData`]; the kernel consumes only these types and never sees
//! protocol structures.

use planck_noalloc::vec::ArrayVec;

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_mm::vm_object::Mode;

use crate::config::{MAX_BOOT_MEMORY_REGIONS, MAX_KERNEL_SEGMENTS};

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Normal usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage; never usable.
    AcpiNvs,
    /// Defective physical memory.
    BadMemory,
    /// Bootloader-owned memory, reclaimable once its data is consumed.
    BootloaderReclaimable,
    /// The kernel image and loaded modules.
    KernelAndModules,
    /// A memory-mapped framebuffer.
    Framebuffer,
}

/// A contiguous physical memory region from the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// What the region holds.
    pub kind: MemoryRegionKind,
}

/// One loadable piece of the kernel image with its access mode.
#[derive(Debug, Clone, Copy)]
pub struct KernelSegment {
    /// Physical load address.
    pub phys: PhysAddr,
    /// Virtual address the kernel links this segment at.
    pub virt: VirtAddr,
    /// Segment length in bytes, page-rounded.
    pub len: u64,
    /// Mapping mode (text is `KernelRX`, rodata `KernelR`, data `KernelRW`).
    pub mode: Mode,
}

/// The raw kernel ELF file as loaded from the boot medium. Mapped read-only
/// at the kernel-image window for backtrace symbolication.
#[derive(Debug, Clone, Copy)]
pub struct KernelFileInfo {
    /// Physical address of the file image.
    pub phys: PhysAddr,
    /// File length in bytes.
    pub len: u64,
}

/// Everything the core consumes from the bootloader.
#[derive(Debug)]
pub struct BootInfoData {
    /// The physical memory map, sorted by start address.
    pub memory_map: ArrayVec<MemoryRegion, MAX_BOOT_MEMORY_REGIONS>,
    /// Loadable kernel segments.
    pub kernel_segments: ArrayVec<KernelSegment, MAX_KERNEL_SEGMENTS>,
    /// The raw kernel file image, when the loader passed one.
    pub kernel_file: Option<KernelFileInfo>,
    /// EFI system table pointer, forwarded to ACPI userland later.
    pub efi_system_table: Option<PhysAddr>,
}

impl BootInfoData {
    /// An empty boot description (no memory, no segments).
    pub fn empty() -> Self {
        Self {
            memory_map: ArrayVec::new(),
            kernel_segments: ArrayVec::new(),
            kernel_file: None,
            efi_system_table: None,
        }
    }

    /// Iterates the usable RAM regions.
    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.memory_map
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
    }

    /// Total bytes of usable RAM.
    pub fn usable_bytes(&self) -> u64 {
        self.usable_regions().map(|r| r.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, size: u64, kind: MemoryRegionKind) -> MemoryRegion {
        MemoryRegion {
            start: PhysAddr::new(start),
            size,
            kind,
        }
    }

    #[test]
    fn usable_filtering() {
        let mut info = BootInfoData::empty();
        info.memory_map
            .push(region(0x0, 0x9F000, MemoryRegionKind::Usable));
        info.memory_map
            .push(region(0x9F000, 0x1000, MemoryRegionKind::Reserved));
        info.memory_map
            .push(region(0x100000, 0x700000, MemoryRegionKind::Usable));
        info.memory_map
            .push(region(0x800000, 0x100000, MemoryRegionKind::KernelAndModules));

        assert_eq!(info.usable_regions().count(), 2);
        assert_eq!(info.usable_bytes(), 0x9F000 + 0x700000);
    }

    #[test]
    fn empty_info_has_nothing() {
        let info = BootInfoData::empty();
        assert_eq!(info.usable_regions().count(), 0);
        assert!(info.kernel_file.is_none());
        assert!(info.efi_system_table.is_none());
    }
}

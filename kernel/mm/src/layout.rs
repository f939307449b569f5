//! The fixed kernel virtual address layout.
//!
//! Every address at or above [`KERNEL_SPLIT`] belongs to the kernel; the
//! canonical upper half starts at [`PHYS_APERTURE_START`]. The regions here
//! are carved out by convention and never move, so the rest of the kernel can
//! treat them as constants.

use quark_core::addr::VirtAddr;

/// Kernel/user split. Virtual addresses below this belong to userspace.
/// (The canonical gap sits between this and the first usable kernel address.)
pub const KERNEL_SPLIT: u64 = 0x8000_0000_0000_0000;

/// Start of the physical aperture: a permanent linear window over all of
/// physical memory.
pub const PHYS_APERTURE_START: u64 = 0xFFFF_8000_0000_0000;
/// Last byte of the physical aperture.
pub const PHYS_APERTURE_END: u64 = 0xFFFF_81FF_FFFF_FFFF;
/// Aperture size: 2 TiB.
pub const PHYS_APERTURE_SIZE: u64 = PHYS_APERTURE_END - PHYS_APERTURE_START + 1;

/// Start of the physical-allocator metadata window (region bitmaps are
/// re-mapped here once the kernel address space is live).
pub const PHYS_ALLOC_METADATA_START: u64 = 0xFFFF_8200_0000_0000;
/// Last byte of the physical-allocator metadata window (1 GiB).
pub const PHYS_ALLOC_METADATA_END: u64 = 0xFFFF_8200_3FFF_FFFF;

/// Start of the memory-mapped view of the kernel ELF image, used for
/// backtrace symbolication.
pub const KERNEL_IMAGE_START: u64 = 0xFFFF_8200_4000_0000;
/// Last byte of the kernel image view.
pub const KERNEL_IMAGE_END: u64 = 0xFFFF_8200_41FF_0000;

/// Start of the kernel executable region. The image itself may be slid
/// anywhere inside for ASLR.
pub const KERNEL_EXEC_START: u64 = 0xFFFF_FFFF_8000_0000;
/// Last byte of the kernel executable region.
pub const KERNEL_EXEC_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// The named region a virtual address falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelRegion {
    /// Below the split: userspace.
    User,
    /// The physical aperture.
    PhysAperture,
    /// Physical-allocator metadata (region bitmaps).
    AllocatorMetadata,
    /// The kernel ELF image view.
    KernelImage,
    /// The kernel executable.
    KernelExec,
    /// Canonical kernel space with no assigned purpose.
    Unassigned,
}

/// Identifies the region containing `addr`. Useful when diagnosing faults.
pub fn identify(addr: VirtAddr) -> KernelRegion {
    let a = addr.as_u64();
    if a < KERNEL_SPLIT {
        KernelRegion::User
    } else if (PHYS_APERTURE_START..=PHYS_APERTURE_END).contains(&a) {
        KernelRegion::PhysAperture
    } else if (PHYS_ALLOC_METADATA_START..=PHYS_ALLOC_METADATA_END).contains(&a) {
        KernelRegion::AllocatorMetadata
    } else if (KERNEL_IMAGE_START..=KERNEL_IMAGE_END).contains(&a) {
        KernelRegion::KernelImage
    } else if a >= KERNEL_EXEC_START {
        KernelRegion::KernelExec
    } else {
        KernelRegion::Unassigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aperture_is_2_tib() {
        assert_eq!(PHYS_APERTURE_SIZE, 2 << 40);
    }

    #[test]
    fn metadata_window_is_1_gib() {
        assert_eq!(PHYS_ALLOC_METADATA_END - PHYS_ALLOC_METADATA_START + 1, 1 << 30);
    }

    #[test]
    fn regions_identify() {
        assert_eq!(identify(VirtAddr::new(0x1000)), KernelRegion::User);
        assert_eq!(
            identify(VirtAddr::new(0xFFFF_8000_1234_5678)),
            KernelRegion::PhysAperture
        );
        assert_eq!(
            identify(VirtAddr::new(PHYS_ALLOC_METADATA_START)),
            KernelRegion::AllocatorMetadata
        );
        assert_eq!(
            identify(VirtAddr::new(KERNEL_IMAGE_START)),
            KernelRegion::KernelImage
        );
        assert_eq!(
            identify(VirtAddr::new(0xFFFF_FFFF_8000_0000)),
            KernelRegion::KernelExec
        );
        assert_eq!(
            identify(VirtAddr::new(0xFFFF_9000_0000_0000)),
            KernelRegion::Unassigned
        );
    }

    #[test]
    fn aperture_base_pml4_slot() {
        // The aperture starts exactly at PML4 slot 256 and spans four slots.
        assert_eq!(VirtAddr::new(PHYS_APERTURE_START).pml4_index(), 256);
        assert_eq!(VirtAddr::new(PHYS_APERTURE_END).pml4_index(), 259);
    }
}

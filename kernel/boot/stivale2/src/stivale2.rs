//! Stivale2 protocol structures.
//!
//! Just enough of the protocol for what the kernel consumes: the memory
//! map, the kernel's load addresses, the raw kernel file, and the EFI
//! system table pointer. All structures are `repr(C)` mirrors of the
//! specification's layout; tags form a singly linked list threaded through
//! identity-mapped memory.

/// The header the bootloader looks for in the `.stivale2hdr` ELF section.
#[repr(C)]
pub struct Stivale2Header {
    /// Alternative entry point, or 0 to use the ELF entry.
    pub entry_point: u64,
    /// Top of the stack the kernel is entered on.
    pub stack: *const u8,
    /// Header flags.
    pub flags: u64,
    /// Head of the header tag list (unused by this kernel).
    pub tags: *const (),
}

// SAFETY: The header is immutable protocol data; the pointers are only read
// by the bootloader before the kernel runs.
unsafe impl Sync for Stivale2Header {}

/// The structure the bootloader passes to the kernel entry point.
#[repr(C)]
pub struct Stivale2Struct {
    /// Bootloader brand string.
    pub bootloader_brand: [u8; 64],
    /// Bootloader version string.
    pub bootloader_version: [u8; 64],
    /// Head of the response tag list.
    pub tags: u64,
}

/// Common prefix of every response tag.
#[repr(C)]
pub struct Tag {
    /// Tag identifier.
    pub identifier: u64,
    /// Next tag, or 0.
    pub next: u64,
}

/// Memory map tag identifier.
pub const MEMMAP_ID: u64 = 0x2187_F79E_8612_DE07;
/// Kernel file (v2, with size) tag identifier.
pub const KERNEL_FILE_V2_ID: u64 = 0x37C1_3018_A02C_6EA2;
/// Kernel base address tag identifier.
pub const KERNEL_BASE_ADDRESS_ID: u64 = 0x060D_7887_4A2A_8AF0;
/// EFI system table tag identifier.
pub const EFI_SYSTEM_TABLE_ID: u64 = 0x4BC5_EC15_845B_558E;

/// Memory map tag: a count-prefixed array of [`MemmapEntry`].
#[repr(C)]
pub struct MemmapTag {
    /// Common tag prefix.
    pub tag: Tag,
    /// Number of entries that follow.
    pub entries: u64,
    // entries follow inline
}

impl MemmapTag {
    /// The memory map entries.
    ///
    /// # Safety
    ///
    /// `self` must point into a live, bootloader-provided tag.
    pub unsafe fn entries(&self) -> &[MemmapEntry] {
        let first = (self as *const Self as usize + core::mem::size_of::<Self>())
            as *const MemmapEntry;
        // SAFETY: The bootloader guarantees `entries` records follow the tag.
        unsafe { core::slice::from_raw_parts(first, self.entries as usize) }
    }
}

/// One memory map record.
#[repr(C)]
pub struct MemmapEntry {
    /// Physical base.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Entry type (see the `memmap_type` constants).
    pub entry_type: u32,
    /// Reserved.
    pub unused: u32,
}

/// Memory map entry types.
pub mod memmap_type {
    /// Usable RAM.
    pub const USABLE: u32 = 1;
    /// Reserved.
    pub const RESERVED: u32 = 2;
    /// ACPI tables, reclaimable.
    pub const ACPI_RECLAIMABLE: u32 = 3;
    /// ACPI NVS.
    pub const ACPI_NVS: u32 = 4;
    /// Defective RAM.
    pub const BAD_MEMORY: u32 = 5;
    /// Bootloader memory, reclaimable after boot.
    pub const BOOTLOADER_RECLAIMABLE: u32 = 0x1000;
    /// The kernel and its modules.
    pub const KERNEL_AND_MODULES: u32 = 0x1001;
    /// Framebuffer memory.
    pub const FRAMEBUFFER: u32 = 0x1002;
}

/// Kernel file tag (v2): the raw kernel ELF left in memory by the loader.
#[repr(C)]
pub struct KernelFileV2Tag {
    /// Common tag prefix.
    pub tag: Tag,
    /// Address of the file image.
    pub kernel_file: u64,
    /// File size in bytes.
    pub kernel_size: u64,
}

/// Kernel base address tag.
#[repr(C)]
pub struct KernelBaseAddressTag {
    /// Common tag prefix.
    pub tag: Tag,
    /// Physical load base.
    pub physical_base_address: u64,
    /// Virtual base the kernel runs at.
    pub virtual_base_address: u64,
}

/// EFI system table tag.
#[repr(C)]
pub struct EfiSystemTableTag {
    /// Common tag prefix.
    pub tag: Tag,
    /// Physical address of the EFI system table.
    pub system_table: u64,
}

/// Iterates the response tag list.
pub struct TagIter {
    next: u64,
}

impl TagIter {
    /// Starts at the head of `info`'s tag list.
    pub fn new(info: &Stivale2Struct) -> Self {
        Self { next: info.tags }
    }
}

impl Iterator for TagIter {
    type Item = *const Tag;

    fn next(&mut self) -> Option<*const Tag> {
        if self.next == 0 {
            return None;
        }
        let tag = self.next as *const Tag;
        // SAFETY: The bootloader links valid tags until a null next pointer.
        self.next = unsafe { (*tag).next };
        Some(tag)
    }
}

/// Finds the tag with `identifier`, cast to its concrete type.
///
/// # Safety
///
/// `T` must match the layout of the tag with that identifier.
pub unsafe fn find_tag<T>(info: &Stivale2Struct, identifier: u64) -> Option<&T> {
    // SAFETY: Tag pointers come from the bootloader's linked list; the
    // caller vouches for the type.
    TagIter::new(info)
        .find(|&tag| unsafe { (*tag).identifier } == identifier)
        .map(|tag| unsafe { &*(tag as *const T) })
}

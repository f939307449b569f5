//! Stivale2 boot stub.
//!
//! Declares the stivale2 header, converts the loader's response tags into
//! the kernel's [`BootInfoData`], and enters
//! [`kernel_init`](quark_kernel::kernel_init). Also owns the panic handler:
//! panics format through the kernel's common path onto the serial console.

#![no_std]
#![no_main]

mod serial;
mod stivale2;

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::kinfo;
use quark_kernel::boot::{
    BootInfoData, KernelFileInfo, KernelSegment, MemoryRegion, MemoryRegionKind,
};
use quark_mm::FRAME_SIZE;
use quark_mm::vm_object::Mode;

use stivale2::{
    EFI_SYSTEM_TABLE_ID, EfiSystemTableTag, KERNEL_BASE_ADDRESS_ID, KERNEL_FILE_V2_ID,
    KernelBaseAddressTag, KernelFileV2Tag, MEMMAP_ID, MemmapTag, Stivale2Header, Stivale2Struct,
    memmap_type,
};

unsafe extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
}

/// Boot stack size: generous, since `kernel_init` runs entirely on it.
const BOOT_STACK_SIZE: usize = 64 * 1024;

/// The stack the bootloader enters the kernel on. Grows down from its top.
#[repr(C, align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);

static BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

/// The stivale2 header the bootloader finds in our ELF image.
#[used]
#[unsafe(link_section = ".stivale2hdr")]
static STIVALE2_HEADER: Stivale2Header = Stivale2Header {
    entry_point: 0, // use the ELF entry point (_start)
    // SAFETY: One-past-the-end of the stack array, as LIFO stacks want.
    stack: unsafe { (&raw const BOOT_STACK).cast::<u8>().add(BOOT_STACK_SIZE) },
    flags: 0,
    tags: core::ptr::null(),
};

/// Kernel entry. The bootloader hands us a pointer to its response
/// structure in RDI.
#[unsafe(no_mangle)]
extern "C" fn _start(info: *const Stivale2Struct) -> ! {
    serial::init();
    kinfo!("quark booting via stivale2");

    // SAFETY: The bootloader passes a valid response structure.
    let info = unsafe { &*info };
    let boot = build_boot_info(info);

    quark_kernel::kernel_init(&boot)
}

/// Converts the stivale2 response tags into the kernel's boot description.
fn build_boot_info(info: &Stivale2Struct) -> BootInfoData {
    let mut boot = BootInfoData::empty();

    // SAFETY: Tag layouts match their identifiers per the protocol.
    let memmap: &MemmapTag =
        unsafe { stivale2::find_tag(info, MEMMAP_ID) }.expect("stivale2: no memory map");
    // SAFETY: Entries follow the tag inline.
    for entry in unsafe { memmap.entries() } {
        boot.memory_map.push(MemoryRegion {
            start: PhysAddr::new(entry.base),
            size: entry.length,
            kind: convert_memmap_kind(entry.entry_type),
        });
    }

    // SAFETY: As above.
    if let Some(file) = unsafe { stivale2::find_tag::<KernelFileV2Tag>(info, KERNEL_FILE_V2_ID) } {
        boot.kernel_file = Some(KernelFileInfo {
            phys: PhysAddr::new(file.kernel_file),
            len: file.kernel_size,
        });
    }

    // SAFETY: As above.
    if let Some(efi) = unsafe { stivale2::find_tag::<EfiSystemTableTag>(info, EFI_SYSTEM_TABLE_ID) }
    {
        boot.efi_system_table = Some(PhysAddr::new(efi.system_table));
    }

    // SAFETY: As above.
    let base = unsafe {
        stivale2::find_tag::<KernelBaseAddressTag>(info, KERNEL_BASE_ADDRESS_ID)
    }
    .expect("stivale2: no kernel base address");
    collect_kernel_segments(&mut boot, base);

    boot
}

/// Describes the kernel's own image as mappable segments using the linker
/// bounds: text RX, rodata R, data+bss RW.
fn collect_kernel_segments(boot: &mut BootInfoData, base: &KernelBaseAddressTag) {
    let virt_base = base.virtual_base_address;
    let phys_base = base.physical_base_address;

    let mut add = |start: *const u8, end: *const u8, mode: Mode| {
        let start = (start as u64) & !(FRAME_SIZE - 1);
        let end = (end as u64).next_multiple_of(FRAME_SIZE);
        if start >= end {
            return;
        }
        boot.kernel_segments.push(KernelSegment {
            phys: PhysAddr::new(start - virt_base + phys_base),
            virt: VirtAddr::new(start),
            len: end - start,
            mode,
        });
    };

    // SAFETY: The linker script defines these bounds inside the image.
    unsafe {
        add(&__text_start, &__text_end, Mode::KernelRX);
        add(&__rodata_start, &__rodata_end, Mode::KernelR);
        add(&__data_start, &__data_end, Mode::KernelRW);
    }
}

fn convert_memmap_kind(kind: u32) -> MemoryRegionKind {
    match kind {
        memmap_type::USABLE => MemoryRegionKind::Usable,
        memmap_type::ACPI_RECLAIMABLE => MemoryRegionKind::AcpiReclaimable,
        memmap_type::ACPI_NVS => MemoryRegionKind::AcpiNvs,
        memmap_type::BAD_MEMORY => MemoryRegionKind::BadMemory,
        memmap_type::BOOTLOADER_RECLAIMABLE => MemoryRegionKind::BootloaderReclaimable,
        memmap_type::KERNEL_AND_MODULES => MemoryRegionKind::KernelAndModules,
        memmap_type::FRAMEBUFFER => MemoryRegionKind::Framebuffer,
        _ => MemoryRegionKind::Reserved,
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    quark_kernel::panic::panic_common(info)
}

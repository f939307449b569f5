//! The virtual memory manager.
//!
//! Owns the kernel address space and the VM entries registered in it, and is
//! the place the trap plane routes page faults into. A fault landing inside
//! a registered entry is backed on demand; anything else is escalated with
//! full diagnostics.

use planck_noalloc::vec::ArrayVec;

use quark_core::addr::VirtAddr;
use quark_core::arch::x86_64::structures::paging::PageFaultErrorCode;
use quark_core::arch::x86_64::structures::trap_frame::TrapFrame;
use quark_core::kinfo;
use quark_core::sync::SpinLock;

use quark_mm::page_table::{AddressSpace, AddressSpaceConfig, FrameSource, MapError};
use quark_mm::vm_object::{MapEntry, Mode};
use quark_mm::{FRAME_SIZE, aperture, layout, pmm};

use crate::boot::BootInfoData;
use crate::config::{MAX_KERNEL_VM_ENTRIES, REGISTER_DUMP_BUFFER};

/// The kernel address space plus its registered VM entries.
pub struct KernelVm {
    space: AddressSpace,
    entries: ArrayVec<(VirtAddr, MapEntry), MAX_KERNEL_VM_ENTRIES>,
}

impl KernelVm {
    /// Wraps an address space with no registered entries yet.
    pub fn new(space: AddressSpace) -> Self {
        Self {
            space,
            entries: ArrayVec::new(),
        }
    }

    /// The underlying address space.
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Registers `entry` at `base` and lets it write any eager mappings.
    pub fn add_entry(
        &mut self,
        base: VirtAddr,
        entry: MapEntry,
        alloc: &mut FrameSource<'_>,
    ) -> Result<(), MapError> {
        entry.added_to(base, &self.space, alloc)?;
        self.entries.push((base, entry));
        Ok(())
    }

    /// Finds the entry whose range contains `addr`.
    pub fn entry_containing(&self, addr: VirtAddr) -> Option<(VirtAddr, &MapEntry)> {
        self.entries
            .iter()
            .find(|(base, entry)| {
                addr.as_u64() >= base.as_u64() && addr.as_u64() - base.as_u64() < entry.length()
            })
            .map(|(base, entry)| (*base, entry))
    }

    /// Tries to satisfy a fault at `addr` from the registered entries.
    ///
    /// Returns `Ok(true)` when a page was backed in, `Ok(false)` when no
    /// entry covers the address or the page was already mapped (a protection
    /// fault, not missing backing).
    pub fn fault_in(
        &self,
        addr: VirtAddr,
        alloc: &mut FrameSource<'_>,
    ) -> Result<bool, MapError> {
        let Some((base, entry)) = self.entry_containing(addr) else {
            return Ok(false);
        };
        if self.space.translate(addr).is_some() {
            return Ok(false);
        }
        entry.fault_in(base, addr, &self.space, alloc)?;
        Ok(true)
    }
}

/// The process-wide kernel VM.
static KERNEL_VM: SpinLock<Option<KernelVm>> = SpinLock::new(None);

/// Runs `f` with the kernel VM.
///
/// # Panics
///
/// Panics if the VM manager has not been initialized.
pub fn with_vm<R>(f: impl FnOnce(&mut KernelVm) -> R) -> R {
    let mut vm = KERNEL_VM.lock();
    f(vm.as_mut().expect("VM manager not initialized"))
}

/// Runs `f` with the kernel VM unless its lock is held or it is not
/// initialized. Fault-path safe.
pub fn try_with_vm<R>(f: impl FnOnce(&mut KernelVm) -> R) -> Option<R> {
    let mut vm = KERNEL_VM.try_lock()?;
    Some(f(vm.as_mut()?))
}

/// Builds the kernel address space, installs the aperture, re-homes the
/// allocator bitmaps, and switches onto the new tables.
///
/// Runs once during boot, on the BSP, while the bootloader identity map is
/// still active.
pub fn init(boot: &BootInfoData) {
    let mut alloc = || pmm::allocate_frame(0).ok();

    // The first address space constructed installs the aperture PDPTs.
    let space = AddressSpace::new(
        None,
        AddressSpaceConfig::system(),
        aperture::install_flag(),
        &mut alloc,
    );

    let mut entries: ArrayVec<(VirtAddr, MapEntry), MAX_KERNEL_VM_ENTRIES> = ArrayVec::new();

    // The kernel image itself, segment by segment with its linked modes.
    for seg in boot.kernel_segments.iter() {
        let entry = MapEntry::contiguous(seg.phys, seg.len, seg.mode);
        entry
            .added_to(seg.virt, &space, &mut alloc)
            .expect("failed to map kernel segment");
        entries.push((seg.virt, entry));
    }

    // The raw ELF file view used for backtrace symbolication.
    if let Some(file) = &boot.kernel_file {
        let len = file.len.next_multiple_of(FRAME_SIZE);
        let entry = MapEntry::contiguous(file.phys, len, Mode::KernelR);
        let base = VirtAddr::new(layout::KERNEL_IMAGE_START);
        entry
            .added_to(base, &space, &mut alloc)
            .expect("failed to map kernel image view");
        entries.push((base, entry));
    }

    // Re-home the allocator bitmaps into the metadata window before the
    // identity map disappears.
    pmm::with(|allocator| {
        // SAFETY: Called once, on the address space about to be activated.
        unsafe { allocator.apply_virtual_map(&space) }
    })
    .expect("failed to re-map allocator bitmaps");

    // SAFETY: The new tables map the kernel image (just written above) and
    // the aperture; after activation the aperture window is authoritative.
    unsafe {
        space.activate();
        aperture::set_live();
    }

    // Re-view the same tables through the live aperture.
    // SAFETY: `space` was built by us and is the active hierarchy.
    let space =
        unsafe { AddressSpace::adopt(space.pml4_addr(), AddressSpaceConfig::system()) };

    let mut vm = KernelVm::new(space);
    vm.entries = entries;

    let mut guard = KERNEL_VM.lock();
    assert!(guard.is_none(), "VM manager already initialized");
    *guard = Some(vm);
    drop(guard);

    kinfo!("VM manager online, kernel address space active");
}

/// Registers an anonymous, demand-backed kernel range at `base`.
///
/// Pages materialize on first touch via the page-fault path.
pub fn reserve_anonymous(base: VirtAddr, len: u64, mode: Mode) -> Result<(), MapError> {
    with_vm(|vm| {
        let mut alloc = || pmm::allocate_frame(0).ok();
        vm.add_entry(base, MapEntry::anonymous(len, mode), &mut alloc)
    })
}

/// The VM manager's page-fault entry, invoked by the trap dispatcher with
/// the faulting address from CR2.
pub fn handle_fault(frame: &mut TrapFrame, fault_addr: u64) {
    let error = PageFaultErrorCode::from_bits_truncate(frame.error_code);

    // Demand backing only applies to canonical addresses on not-present
    // faults; protection violations always escalate.
    if !error.contains(PageFaultErrorCode::PRESENT) {
        if let Some(addr) = VirtAddr::try_new(fault_addr) {
            let backed = try_with_vm(|vm| {
                // Non-blocking allocator access: a fault taken while the
                // allocator lock is held must not spin on it forever.
                let mut alloc = || pmm::try_with(|a| a.allocate_frame(0).ok()).flatten();
                vm.fault_in(addr, &mut alloc)
            });
            match backed {
                Some(Ok(true)) => return,
                Some(Ok(false)) | None => {}
                Some(Err(err)) => {
                    panic!("page fault at {fault_addr:#x}: backing failed: {err}")
                }
            }
        }
    }

    escalate(frame, fault_addr, error);
}

/// No entry claimed the fault: report and panic.
fn escalate(frame: &TrapFrame, fault_addr: u64, error: PageFaultErrorCode) -> ! {
    let access = if error.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        "instruction fetch"
    } else if error.contains(PageFaultErrorCode::WRITE) {
        "write"
    } else {
        "read"
    };
    let cause = if error.contains(PageFaultErrorCode::PRESENT) {
        "protection violation"
    } else {
        "page not present"
    };
    let mode = if frame.from_user_mode() { "user" } else { "kernel" };
    let region = layout::identify(VirtAddr::new_truncate(fault_addr));

    let mut buf = [0u8; REGISTER_DUMP_BUFFER];
    let len = frame.format_into(&mut buf);
    let dump = core::str::from_utf8(&buf[..len]).unwrap_or("<unprintable>");

    panic!(
        "PAGE FAULT: {cause} during {mode} {access}\n  \
         Address: {fault_addr:#x} ({region:?})\n  Error: {error:?}\n{dump}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use quark_core::addr::PhysAddr;
    use quark_core::arch::x86_64::structures::trap_frame::vector;
    use quark_mm::aperture::{ApertureInstallFlag, PhysAperture};
    use std::alloc::Layout;

    struct TestFrames {
        buf: *mut u8,
        layout: Layout,
        next: std::cell::Cell<u64>,
        limit: u64,
    }

    impl TestFrames {
        fn new(frames: usize) -> Self {
            let len = frames * FRAME_SIZE as usize;
            let layout = Layout::from_size_align(len, FRAME_SIZE as usize).unwrap();
            // SAFETY: Non-zero, valid layout.
            let buf = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!buf.is_null());
            Self {
                buf,
                layout,
                next: std::cell::Cell::new(0),
                limit: len as u64,
            }
        }

        fn config(&self) -> AddressSpaceConfig {
            AddressSpaceConfig {
                aperture: PhysAperture::at_offset(self.buf as u64),
                nx_enabled: true,
            }
        }

        fn source(&self) -> impl FnMut() -> Option<PhysAddr> + '_ {
            move || {
                let at = self.next.get();
                if at + FRAME_SIZE > self.limit {
                    return None;
                }
                self.next.set(at + FRAME_SIZE);
                Some(PhysAddr::new(at))
            }
        }
    }

    impl Drop for TestFrames {
        fn drop(&mut self) {
            // SAFETY: Allocated with the stored layout.
            unsafe { std::alloc::dealloc(self.buf, self.layout) };
        }
    }

    fn test_vm(frames: &TestFrames) -> KernelVm {
        let flag = ApertureInstallFlag::new();
        flag.try_claim();
        let mut alloc = frames.source();
        KernelVm::new(AddressSpace::new(None, frames.config(), &flag, &mut alloc))
    }

    #[test]
    fn anonymous_entry_faults_in_on_demand() {
        let frames = TestFrames::new(64);
        let mut vm = test_vm(&frames);
        let mut alloc = frames.source();

        let base = VirtAddr::new(0xFFFF_9000_0000_0000);
        vm.add_entry(base, MapEntry::anonymous(4 * FRAME_SIZE, Mode::KernelRW), &mut alloc)
            .unwrap();

        // Nothing mapped until a fault arrives.
        assert!(vm.space().translate(base).is_none());

        let fault = base + FRAME_SIZE + 0x42;
        assert_eq!(vm.fault_in(fault, &mut alloc), Ok(true));
        assert!(vm.space().translate(fault).is_some());

        // The page is mapped now; a second fault there is a protection
        // problem, not missing backing.
        assert_eq!(vm.fault_in(fault, &mut alloc), Ok(false));
    }

    #[test]
    fn contiguous_entry_is_eager() {
        let frames = TestFrames::new(64);
        let mut vm = test_vm(&frames);
        let mut alloc = frames.source();

        let base = VirtAddr::new(0xFFFF_A000_0000_0000);
        vm.add_entry(
            base,
            MapEntry::contiguous(PhysAddr::new(0x2_0000), 2 * FRAME_SIZE, Mode::KernelR),
            &mut alloc,
        )
        .unwrap();

        assert_eq!(
            vm.space().translate(base + 0x10),
            Some(PhysAddr::new(0x2_0010))
        );
        assert_eq!(
            vm.space().translate(base + FRAME_SIZE),
            Some(PhysAddr::new(0x2_1000))
        );
    }

    #[test]
    fn fault_outside_every_entry_is_unclaimed() {
        let frames = TestFrames::new(64);
        let vm = test_vm(&frames);
        let mut alloc = frames.source();

        assert_eq!(
            vm.fault_in(VirtAddr::new(0xFFFF_B000_0000_0000), &mut alloc),
            Ok(false)
        );
    }

    #[test]
    fn entry_containing_honors_bounds() {
        let frames = TestFrames::new(64);
        let mut vm = test_vm(&frames);
        let mut alloc = frames.source();

        let base = VirtAddr::new(0xFFFF_9000_0000_0000);
        vm.add_entry(base, MapEntry::anonymous(2 * FRAME_SIZE, Mode::KernelRW), &mut alloc)
            .unwrap();

        assert!(vm.entry_containing(base).is_some());
        assert!(vm.entry_containing(base + 2 * FRAME_SIZE - 1).is_some());
        assert!(vm.entry_containing(base + 2 * FRAME_SIZE).is_none());
        assert!(vm.entry_containing(base - 1).is_none());
    }

    #[test]
    fn unclaimed_fault_escalates_with_diagnostics() {
        // The global VM is uninitialized in this process, so any fault
        // escalates. The message carries cause, mode, region, and the dump.
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::PAGE_FAULT);
            frame.error_code = 0b010; // kernel write, not present
            handle_fault(&mut frame, 0xDEAD_B000);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("PAGE FAULT: page not present during kernel write"));
        assert!(message.contains("0xdeadb000"), "{message}");
        assert!(message.contains("User"), "region tag missing: {message}");
    }
}

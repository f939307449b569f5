//! The page-table engine: construction, walking, and mutation of 4-level
//! amd64 page tables.
//!
//! An [`AddressSpace`] owns one PML4 frame and reaches every paging structure
//! through the physical aperture, so tables can be edited without the target
//! address space being active. Frames for new tables come from a caller
//! supplied [`FrameSource`], which in the kernel is bound to the physical
//! allocator's default pool.

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::arch::x86_64::registers::control::Cr3;
use quark_core::arch::x86_64::structures::paging::{PageTableEntry, PageTableFlags};

use crate::aperture::{ApertureInstallFlag, PhysAperture};
use crate::vm_object::Mode;
use crate::{FRAME_SIZE, layout};

/// First PML4 slot of the kernel half. Slots from here up are shared between
/// every address space.
pub const KERNEL_PML4_SLOT: usize = 256;

/// Page-table mutation errors. All recoverable; the engine never panics on
/// an external failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame source could not supply a frame for a new table.
    OutOfFrames,
    /// A larger page already maps this range at an intermediate level.
    ConflictingLargePage,
    /// The virtual address lies in the non-canonical gap.
    NonCanonical,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of frames for page tables"),
            Self::ConflictingLargePage => write!(f, "conflicting large page mapping"),
            Self::NonCanonical => write!(f, "non-canonical virtual address"),
        }
    }
}

/// Supplies 4 KiB frames for new paging structures. Returning `None` means
/// the backing pool is exhausted.
pub type FrameSource<'a> = dyn FnMut() -> Option<PhysAddr> + 'a;

/// How an address space reaches and encodes its tables.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpaceConfig {
    /// Translation window used for all table reads and writes.
    pub aperture: PhysAperture,
    /// Whether page table entries may carry the no-execute bit.
    pub nx_enabled: bool,
}

impl AddressSpaceConfig {
    /// The running system's configuration: the current aperture window and
    /// the processor's NX state.
    pub fn system() -> Self {
        Self {
            aperture: crate::aperture::current(),
            nx_enabled: quark_core::arch::x86_64::cpu::nx_enabled(),
        }
    }
}

/// A 4-level page table rooted at one PML4 frame.
pub struct AddressSpace {
    pml4: PhysAddr,
    config: AddressSpaceConfig,
}

impl AddressSpace {
    /// Builds a new address space.
    ///
    /// With a `parent`, PML4 slots 256..511 are copied bitwise so kernel
    /// mappings are shared. The construction that wins `install` also writes
    /// the physical-aperture PDPTs (1 GiB supervisor pages over all of
    /// physical memory) into its own kernel slots; every later construction
    /// inherits them through the parent copy.
    ///
    /// # Panics
    ///
    /// Panics if the frame source cannot supply the PML4 or the aperture
    /// PDPTs. Address-space construction this early has no caller able to
    /// recover.
    pub fn new(
        parent: Option<&AddressSpace>,
        config: AddressSpaceConfig,
        install: &ApertureInstallFlag,
        alloc: &mut FrameSource<'_>,
    ) -> Self {
        let pml4 =
            Self::alloc_table(config.aperture, alloc).expect("failed to allocate PML4 frame");
        let space = Self { pml4, config };

        if let Some(parent) = parent {
            let src = config.aperture.window(parent.pml4);
            let dst = config.aperture.window(pml4);
            for slot in KERNEL_PML4_SLOT..512 {
                dst.write_u64(slot, src.read_u64(slot));
            }
        }

        if install.try_claim() {
            space
                .install_aperture(alloc)
                .expect("failed to allocate aperture PDPTs");
        }

        space
    }

    /// Wraps an existing PML4 without touching it. Used to re-view the
    /// kernel map under a new configuration once the aperture goes live.
    ///
    /// # Safety
    ///
    /// `pml4` must be the root of a valid 4-level table reachable through
    /// `config.aperture`.
    pub unsafe fn adopt(pml4: PhysAddr, config: AddressSpaceConfig) -> Self {
        Self { pml4, config }
    }

    /// Physical address of the PML4.
    pub fn pml4_addr(&self) -> PhysAddr {
        self.pml4
    }

    /// The translation window this address space edits its tables through.
    pub fn aperture(&self) -> PhysAperture {
        self.config.aperture
    }

    /// Reads a PML4 entry.
    pub fn pml4_entry(&self, slot: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.config.aperture.window(self.pml4).read_u64(slot))
    }

    /// Allocates a frame and zeroes it through the aperture, so stale data
    /// is never misread as present entries.
    fn alloc_table(aperture: PhysAperture, alloc: &mut FrameSource<'_>) -> Option<PhysAddr> {
        let frame = alloc()?;
        aperture.window(frame).zero(FRAME_SIZE as usize);
        Some(frame)
    }

    /// Fills the aperture PML4 slots: one PDPT per 512 GiB of aperture, each
    /// holding 512 one-GiB supervisor pages (writable, global, write-through,
    /// and non-executable where the platform allows).
    fn install_aperture(&self, alloc: &mut FrameSource<'_>) -> Result<(), MapError> {
        const GIB: u64 = 1 << 30;
        const PDPT_SPAN: u64 = 512 * GIB;

        let pml4_window = self.config.aperture.window(self.pml4);

        for i in 0..(layout::PHYS_APERTURE_SIZE / PDPT_SPAN) as usize {
            let pdpt =
                Self::alloc_table(self.config.aperture, alloc).ok_or(MapError::OutOfFrames)?;
            let window = self.config.aperture.window(pdpt);
            let phys_base = i as u64 * PDPT_SPAN;

            let mut leaf_flags = PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | PageTableFlags::HUGE_PAGE
                | PageTableFlags::GLOBAL
                | PageTableFlags::WRITE_THROUGH;
            if self.config.nx_enabled {
                leaf_flags |= PageTableFlags::NO_EXECUTE;
            }

            for slot in 0..512 {
                let entry =
                    PageTableEntry::new(PhysAddr::new(phys_base + slot as u64 * GIB), leaf_flags);
                window.write_u64(slot, entry.raw());
            }

            let mut pml4_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            if self.config.nx_enabled {
                pml4_flags |= PageTableFlags::NO_EXECUTE;
            }
            pml4_window.write_u64(
                KERNEL_PML4_SLOT + i,
                PageTableEntry::new(pdpt, pml4_flags).raw(),
            );
        }

        Ok(())
    }

    /// Maps one 4 KiB frame at `virt`, allocating intermediate tables as
    /// needed.
    ///
    /// A failed map may leave freshly allocated empty intermediate tables in
    /// place; they are harmless and get reused by later maps.
    pub fn map_page(
        &self,
        phys: PhysAddr,
        virt: u64,
        mode: Mode,
        alloc: &mut FrameSource<'_>,
    ) -> Result<(), MapError> {
        let virt = VirtAddr::try_new(virt).ok_or(MapError::NonCanonical)?;

        // A user-accessible leaf needs USER on every intermediate along its
        // path, so fresh intermediates below the split get it.
        let user_path = virt.as_u64() < layout::KERNEL_SPLIT;

        let pdpt = self.ensure_table(self.pml4, virt.pml4_index(), user_path, alloc)?;
        let pd = self.ensure_table(pdpt, virt.pdpt_index(), user_path, alloc)?;
        let pt = self.ensure_table(pd, virt.pd_index(), user_path, alloc)?;

        let mut flags = PageTableFlags::PRESENT;
        if mode.is_writable() {
            flags |= PageTableFlags::WRITABLE;
        }
        if mode.is_user() {
            flags |= PageTableFlags::USER;
        } else {
            // Kernel mappings are shared across address spaces; keep their
            // translations across CR3 reloads.
            flags |= PageTableFlags::GLOBAL;
        }
        if !mode.is_executable() && self.config.nx_enabled {
            flags |= PageTableFlags::NO_EXECUTE;
        }

        self.config
            .aperture
            .window(pt)
            .write_u64(virt.pt_index(), PageTableEntry::new(phys, flags).raw());
        Ok(())
    }

    /// Returns the physical address of the table `table[index]` points at,
    /// allocating and linking a zeroed one if the entry is not present.
    fn ensure_table(
        &self,
        table: PhysAddr,
        index: usize,
        user_path: bool,
        alloc: &mut FrameSource<'_>,
    ) -> Result<PhysAddr, MapError> {
        let window = self.config.aperture.window(table);
        let entry = PageTableEntry::from_raw(window.read_u64(index));

        if entry.is_present() {
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(MapError::ConflictingLargePage);
            }
            return Ok(entry.address());
        }

        let frame = Self::alloc_table(self.config.aperture, alloc).ok_or(MapError::OutOfFrames)?;
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user_path {
            flags |= PageTableFlags::USER;
        }
        window.write_u64(index, PageTableEntry::new(frame, flags).raw());
        Ok(frame)
    }

    /// Returns the 4 KiB leaf entry translating `virt`, or `None` if the
    /// walk ends early (absent entry or large-page leaf).
    pub fn leaf_entry(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        let aperture = self.config.aperture;

        let mut table = self.pml4;
        for index in [virt.pml4_index(), virt.pdpt_index(), virt.pd_index()] {
            let entry = PageTableEntry::from_raw(aperture.window(table).read_u64(index));
            if !entry.is_present() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table = entry.address();
        }

        let entry = PageTableEntry::from_raw(aperture.window(table).read_u64(virt.pt_index()));
        entry.is_present().then_some(entry)
    }

    /// Translates `virt` to a physical address, handling all page sizes.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let aperture = self.config.aperture;

        let pml4e = PageTableEntry::from_raw(
            aperture.window(self.pml4).read_u64(virt.pml4_index()),
        );
        if !pml4e.is_present() {
            return None;
        }

        let pdpte = PageTableEntry::from_raw(
            aperture.window(pml4e.address()).read_u64(virt.pdpt_index()),
        );
        if !pdpte.is_present() {
            return None;
        }
        if pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(pdpte.address() + (virt.as_u64() & 0x3FFF_FFFF));
        }

        let pde = PageTableEntry::from_raw(
            aperture.window(pdpte.address()).read_u64(virt.pd_index()),
        );
        if !pde.is_present() {
            return None;
        }
        if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(pde.address() + (virt.as_u64() & 0x1F_FFFF));
        }

        let pte = PageTableEntry::from_raw(
            aperture.window(pde.address()).read_u64(virt.pt_index()),
        );
        if !pte.is_present() {
            return None;
        }
        Some(pte.address() + virt.page_offset())
    }

    /// Makes this address space active.
    ///
    /// Skipped when it is already active: reloading CR3 would only purge the
    /// TLB for no benefit. The kernel map never needs activating for its own
    /// sake either, since its mappings are present in every address space.
    ///
    /// # Safety
    ///
    /// The table must map all code and data the CPU is executing, including
    /// the current stack.
    pub unsafe fn activate(&self) {
        if Cr3::read() == self.pml4 {
            return;
        }
        // SAFETY: Forwarded to the caller.
        unsafe { Cr3::write(self.pml4) };
    }

    /// Tears the table down, handing every freed table frame to `free`.
    ///
    /// Only the user half (PML4 slots 0..256) is walked: kernel-half tables
    /// are shared with the kernel map, which owns them and is never
    /// destroyed. Leaf frames are not freed either; they belong to the VM
    /// objects that mapped them.
    pub fn destroy(self, free: &mut dyn FnMut(PhysAddr)) {
        let aperture = self.config.aperture;
        let pml4_window = aperture.window(self.pml4);

        for slot in 0..KERNEL_PML4_SLOT {
            let pml4e = PageTableEntry::from_raw(pml4_window.read_u64(slot));
            if !pml4e.is_present() {
                continue;
            }
            let pdpt_window = aperture.window(pml4e.address());

            for j in 0..512 {
                let pdpte = PageTableEntry::from_raw(pdpt_window.read_u64(j));
                if !pdpte.is_present() || pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
                    continue;
                }
                let pd_window = aperture.window(pdpte.address());

                for k in 0..512 {
                    let pde = PageTableEntry::from_raw(pd_window.read_u64(k));
                    if pde.is_present() && !pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                        free(pde.address());
                    }
                }
                free(pdpte.address());
            }
            free(pml4e.address());
        }

        free(self.pml4);
    }
}

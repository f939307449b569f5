//! VM objects: the backing behind virtual mappings.
//!
//! A [`MapEntry`] describes what a range of virtual address space maps to.
//! The variant set is closed — the kernel core only ever instantiates its own
//! backings — so it is a plain tagged union rather than an open trait.

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::arch::x86_64::structures::paging::{PageTableFlags, PageTableEntry};

use crate::FRAME_SIZE;
use crate::page_table::{AddressSpace, FrameSource, MapError};

/// Access mode of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Kernel read-only.
    KernelR,
    /// Kernel read-write.
    KernelRW,
    /// Kernel read-execute.
    KernelRX,
    /// User read-only.
    UserR,
    /// User read-write.
    UserRW,
    /// User read-execute.
    UserRX,
}

impl Mode {
    /// Whether ring 3 may access the mapping.
    pub const fn is_user(self) -> bool {
        matches!(self, Self::UserR | Self::UserRW | Self::UserRX)
    }

    /// Whether the mapping is writable.
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::KernelRW | Self::UserRW)
    }

    /// Whether the mapping is executable.
    pub const fn is_executable(self) -> bool {
        matches!(self, Self::KernelRX | Self::UserRX)
    }

    /// Encodes this mode as leaf PTE flags. `nx_enabled` gates the
    /// no-execute bit, which is reserved-must-be-zero on processors without
    /// NX.
    pub fn pte_flags(self, nx_enabled: bool) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if self.is_writable() {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.is_user() {
            flags |= PageTableFlags::USER;
        } else {
            flags |= PageTableFlags::GLOBAL;
        }
        if !self.is_executable() && nx_enabled {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }

    /// Decodes leaf PTE flags back to a mode.
    ///
    /// Exact only on NX-enabled platforms: without NX the execute permission
    /// is not recorded in the entry, so a writable entry decodes as
    /// non-executable and a writable+executable combination is
    /// unrepresentable. Returns `None` for non-present entries and for
    /// writable-executable combinations, which this kernel never produces.
    pub fn from_pte_flags(flags: PageTableFlags) -> Option<Self> {
        if !flags.contains(PageTableFlags::PRESENT) {
            return None;
        }
        let user = flags.contains(PageTableFlags::USER);
        let write = flags.contains(PageTableFlags::WRITABLE);
        let execute = !flags.contains(PageTableFlags::NO_EXECUTE);

        match (user, write, execute) {
            (false, false, false) => Some(Self::KernelR),
            (false, true, false) => Some(Self::KernelRW),
            (false, false, true) => Some(Self::KernelRX),
            (true, false, false) => Some(Self::UserR),
            (true, true, false) => Some(Self::UserRW),
            (true, false, true) => Some(Self::UserRX),
            (_, true, true) => None,
        }
    }
}

/// A range of virtual address space and the backing that fills it in.
#[derive(Debug, Clone, Copy)]
pub enum MapEntry {
    /// Maps a contiguous physical range one-to-one.
    ContiguousPhys(ContiguousPhysRegion),
    /// Demand-backed zeroed memory; frames are allocated as pages are
    /// touched.
    Anonymous(AnonymousRange),
}

/// A contiguous physical region mapped linearly at the entry's base.
#[derive(Debug, Clone, Copy)]
pub struct ContiguousPhysRegion {
    phys_base: PhysAddr,
    length: u64,
    mode: Mode,
}

/// An anonymous, demand-backed range.
#[derive(Debug, Clone, Copy)]
pub struct AnonymousRange {
    length: u64,
    mode: Mode,
}

impl MapEntry {
    /// Creates a contiguous physical mapping entry.
    ///
    /// # Panics
    ///
    /// Panics unless `phys_base` and `length` are page-aligned and `length`
    /// is nonzero.
    pub fn contiguous(phys_base: PhysAddr, length: u64, mode: Mode) -> Self {
        assert!(phys_base.is_aligned(FRAME_SIZE), "unaligned base {phys_base}");
        assert!(
            length != 0 && length % FRAME_SIZE == 0,
            "unaligned length {length:#x}"
        );
        Self::ContiguousPhys(ContiguousPhysRegion {
            phys_base,
            length,
            mode,
        })
    }

    /// Creates an anonymous demand-backed entry.
    ///
    /// # Panics
    ///
    /// Panics unless `length` is a nonzero multiple of the page size.
    pub fn anonymous(length: u64, mode: Mode) -> Self {
        assert!(
            length != 0 && length % FRAME_SIZE == 0,
            "unaligned length {length:#x}"
        );
        Self::Anonymous(AnonymousRange { length, mode })
    }

    /// Length of the mapped range in bytes.
    pub fn length(&self) -> u64 {
        match self {
            Self::ContiguousPhys(region) => region.length,
            Self::Anonymous(range) => range.length,
        }
    }

    /// Access mode of the range.
    pub fn mode(&self) -> Mode {
        match self {
            Self::ContiguousPhys(region) => region.mode,
            Self::Anonymous(range) => range.mode,
        }
    }

    /// Called when the entry is added to an address space at `base`.
    ///
    /// A contiguous physical region writes all of its page table entries up
    /// front; an anonymous range maps nothing and materializes page by page
    /// through [`fault_in`](Self::fault_in).
    pub fn added_to(
        &self,
        base: VirtAddr,
        space: &AddressSpace,
        alloc: &mut FrameSource<'_>,
    ) -> Result<(), MapError> {
        match self {
            Self::ContiguousPhys(region) => {
                let mut offset = 0;
                while offset < region.length {
                    space.map_page(
                        region.phys_base + offset,
                        (base + offset).as_u64(),
                        region.mode,
                        alloc,
                    )?;
                    offset += FRAME_SIZE;
                }
                Ok(())
            }
            Self::Anonymous(_) => Ok(()),
        }
    }

    /// Backs the single page containing `fault_addr`, for an entry mapped at
    /// `base`. The caller has already checked that the address falls inside
    /// the entry.
    pub fn fault_in(
        &self,
        base: VirtAddr,
        fault_addr: VirtAddr,
        space: &AddressSpace,
        alloc: &mut FrameSource<'_>,
    ) -> Result<(), MapError> {
        let page = fault_addr.align_down(FRAME_SIZE);
        let offset = page - base;
        debug_assert!(offset < self.length(), "fault outside entry");

        match self {
            Self::ContiguousPhys(region) => space.map_page(
                region.phys_base + offset,
                page.as_u64(),
                region.mode,
                alloc,
            ),
            Self::Anonymous(range) => {
                let frame = alloc().ok_or(MapError::OutOfFrames)?;
                // Fresh anonymous memory must read as zeros, and must not
                // leak whatever the frame held before.
                space.aperture().window(frame).zero(FRAME_SIZE as usize);
                space.map_page(frame, page.as_u64(), range.mode, alloc)
            }
        }
    }
}

/// Whether a leaf entry carries exactly the flags `mode` encodes to.
/// Diagnostic helper used when validating fresh mappings.
pub fn leaf_matches_mode(entry: PageTableEntry, mode: Mode, nx_enabled: bool) -> bool {
    entry.flags() == mode.pte_flags(nx_enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aperture::{ApertureInstallFlag, PhysAperture};
    use crate::page_table::AddressSpaceConfig;
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

    #[test]
    fn mode_predicates() {
        assert!(Mode::UserRW.is_user() && Mode::UserRW.is_writable());
        assert!(!Mode::UserRW.is_executable());
        assert!(Mode::KernelRX.is_executable() && !Mode::KernelRX.is_user());
        assert!(!Mode::KernelR.is_writable());
    }

    #[test]
    fn mode_pte_roundtrip_with_nx() {
        for mode in [
            Mode::KernelR,
            Mode::KernelRW,
            Mode::KernelRX,
            Mode::UserR,
            Mode::UserRW,
            Mode::UserRX,
        ] {
            let flags = mode.pte_flags(true);
            assert_eq!(Mode::from_pte_flags(flags), Some(mode), "{mode:?}");
            // Re-encoding the decoded mode yields the same flag set.
            assert_eq!(Mode::from_pte_flags(flags).unwrap().pte_flags(true), flags);
        }
    }

    #[test]
    fn mode_pte_flags_without_nx_omit_the_bit() {
        for mode in [Mode::KernelR, Mode::KernelRW, Mode::UserR, Mode::UserRW] {
            assert!(
                !mode.pte_flags(false).contains(PageTableFlags::NO_EXECUTE),
                "{mode:?} leaked NX on a non-NX platform"
            );
        }
    }

    #[test]
    fn from_pte_flags_rejects_non_present() {
        assert_eq!(Mode::from_pte_flags(PageTableFlags::WRITABLE), None);
    }

    #[test]
    fn contiguous_added_to_maps_every_page() {
        let frames = TestFrames::new(64);
        let flag = ApertureInstallFlag::new();
        flag.try_claim();
        let mut alloc = frames.source();
        let space = AddressSpace::new(None, frames.config(), &flag, &mut alloc);

        let entry = MapEntry::contiguous(PhysAddr::new(0x1_0000), 3 * FRAME_SIZE, Mode::KernelRW);
        let base = VirtAddr::new(0xFFFF_FFFF_9000_0000);
        entry.added_to(base, &space, &mut alloc).unwrap();

        for page in 0..3u64 {
            let leaf = space.leaf_entry(base + page * FRAME_SIZE).unwrap();
            assert_eq!(leaf.address().as_u64(), 0x1_0000 + page * FRAME_SIZE);
            assert!(leaf_matches_mode(leaf, Mode::KernelRW, true));
        }
        assert!(space.leaf_entry(base + 3 * FRAME_SIZE).is_none());
    }

    #[test]
    fn anonymous_faults_in_zeroed_pages() {
        let frames = TestFrames::new(64);
        let flag = ApertureInstallFlag::new();
        flag.try_claim();
        let mut alloc = frames.source();
        let space = AddressSpace::new(None, frames.config(), &flag, &mut alloc);

        let entry = MapEntry::anonymous(4 * FRAME_SIZE, Mode::UserRW);
        let base = VirtAddr::new(0x4000_0000);

        // Registration maps nothing.
        entry.added_to(base, &space, &mut alloc).unwrap();
        assert!(space.leaf_entry(base).is_none());

        // A fault in the middle backs exactly that page.
        let fault = base + 2 * FRAME_SIZE + 0x123;
        entry.fault_in(base, fault, &space, &mut alloc).unwrap();

        let page = base + 2 * FRAME_SIZE;
        let leaf = space.leaf_entry(page).unwrap();
        assert!(leaf_matches_mode(leaf, Mode::UserRW, true));
        assert!(space.leaf_entry(base).is_none());
        assert!(space.leaf_entry(base + 3 * FRAME_SIZE).is_none());

        // The backing frame reads as zeros.
        let window = space.aperture().window(leaf.address());
        for i in 0..(FRAME_SIZE as usize / 8) {
            assert_eq!(window.read_u64(i), 0);
        }
    }

    #[test]
    #[should_panic(expected = "unaligned base")]
    fn contiguous_rejects_unaligned_base() {
        MapEntry::contiguous(PhysAddr::new(0x123), FRAME_SIZE, Mode::KernelR);
    }

    #[test]
    #[should_panic(expected = "unaligned length")]
    fn anonymous_rejects_unaligned_length() {
        MapEntry::anonymous(100, Mode::UserR);
    }
}

//! The physical aperture: how the kernel touches arbitrary physical frames.
//!
//! After the first kernel address space is built, 2 TiB of kernel virtual
//! space linearly mirror all of physical memory, so any frame is reachable at
//! `PHYS_APERTURE_START + phys` with no mapping work. Before that, the
//! bootloader's identity map of the first 4 GiB stands in and physical
//! addresses are used directly.
//!
//! All raw pointer arithmetic over physical memory is confined to this
//! module: callers go through a [`PhysAperture`] translation handle and the
//! [`FrameWindow`] accessor it hands out.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use quark_core::addr::{PhysAddr, VirtAddr};

use crate::FRAME_SIZE;
use crate::layout;

/// Limit of the bootloader identity map usable during early boot.
const EARLY_BOOT_LIMIT: u64 = 0x1_0000_0000;

/// A physical-to-virtual translation window.
///
/// The kernel uses [`current`] to get the live window; tests point one at a
/// host buffer and treat offsets into that buffer as "physical" addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysAperture {
    base: u64,
}

impl PhysAperture {
    /// The early-boot window: physical addresses used as-is through the
    /// bootloader identity map.
    pub const fn identity() -> Self {
        Self { base: 0 }
    }

    /// The permanent aperture window.
    pub const fn live() -> Self {
        Self {
            base: layout::PHYS_APERTURE_START,
        }
    }

    /// A window at an arbitrary virtual offset.
    pub const fn at_offset(base: u64) -> Self {
        Self { base }
    }

    /// Translates a physical address to its address inside this window.
    #[inline]
    pub const fn translate(&self, phys: PhysAddr) -> u64 {
        self.base.wrapping_add(phys.as_u64())
    }

    /// Returns a [`FrameWindow`] over the frame-aligned structure at `phys`.
    #[inline]
    pub fn window(&self, phys: PhysAddr) -> FrameWindow {
        FrameWindow {
            ptr: self.translate(phys) as *mut u64,
        }
    }
}

/// A 64-bit-word accessor over one physical frame (or any frame-aligned
/// structure reached through the aperture).
#[derive(Debug, Clone, Copy)]
pub struct FrameWindow {
    ptr: *mut u64,
}

impl FrameWindow {
    /// Reads the `index`-th u64.
    ///
    /// `index` must stay inside the structure the window was opened over;
    /// table accessors cap it at 511.
    #[inline]
    pub fn read_u64(&self, index: usize) -> u64 {
        debug_assert!(index < (FRAME_SIZE as usize) / 8);
        // SAFETY: The window was opened over a valid frame via an aperture
        // translation, and the index is within the frame.
        unsafe { self.ptr.add(index).read_volatile() }
    }

    /// Writes the `index`-th u64.
    #[inline]
    pub fn write_u64(&self, index: usize, value: u64) {
        debug_assert!(index < (FRAME_SIZE as usize) / 8);
        // SAFETY: As in `read_u64`; the caller owns the frame.
        unsafe { self.ptr.add(index).write_volatile(value) }
    }

    /// Zeroes `len` bytes starting at the window base.
    #[inline]
    pub fn zero(&self, len: usize) {
        // SAFETY: The window covers at least `len` bytes of an owned frame
        // range.
        unsafe { core::ptr::write_bytes(self.ptr.cast::<u8>(), 0, len) }
    }

    /// Reinterprets `words` u64s at the window base as atomics.
    ///
    /// # Safety
    ///
    /// The range must stay valid for the `'static` lifetime (physical memory
    /// owned by the caller and never unmapped), and all concurrent access
    /// must go through atomics.
    #[inline]
    pub unsafe fn as_atomic_words(&self, words: usize) -> &'static [AtomicU64] {
        // SAFETY: AtomicU64 has the same layout as u64; the caller
        // guarantees validity and exclusivity of non-atomic access.
        unsafe { core::slice::from_raw_parts(self.ptr.cast::<AtomicU64>(), words) }
    }
}

// ---------------------------------------------------------------------------
// Process-wide aperture state
// ---------------------------------------------------------------------------

/// Set once the aperture mappings are active in the running address space.
static LIVE: AtomicBool = AtomicBool::new(false);

/// One-shot claim on aperture installation. Exactly one address-space
/// construction wins the compare-and-swap and writes the aperture PDPTs;
/// everyone else inherits them by copying kernel PML4 slots.
pub struct ApertureInstallFlag(AtomicBool);

impl ApertureInstallFlag {
    /// Creates an unclaimed flag.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Attempts to claim installation. Returns `true` exactly once.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` once some construction has claimed installation.
    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for ApertureInstallFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// The system-wide install flag consulted by address-space construction.
static INSTALL_FLAG: ApertureInstallFlag = ApertureInstallFlag::new();

/// Returns the system-wide install flag.
pub fn install_flag() -> &'static ApertureInstallFlag {
    &INSTALL_FLAG
}

/// Returns `true` once the aperture mappings are active.
pub fn is_live() -> bool {
    LIVE.load(Ordering::Acquire)
}

/// Marks the aperture live. Called once, after the address space containing
/// the aperture PDPTs has been activated.
///
/// # Safety
///
/// The active address space must contain the aperture mappings; every
/// subsequent translation goes through them.
pub unsafe fn set_live() {
    LIVE.store(true, Ordering::Release);
}

/// Returns the translation window matching the current boot phase.
pub fn current() -> PhysAperture {
    if is_live() {
        PhysAperture::live()
    } else {
        PhysAperture::identity()
    }
}

/// Translates `length` bytes of physical memory at `phys` to a kernel
/// virtual address.
///
/// During early boot this relies on the bootloader identity map and the
/// physical range must sit below 4 GiB; afterwards any address inside the
/// aperture works.
pub fn phys_to_virt(phys: PhysAddr, length: u64) -> VirtAddr {
    assert!(length != 0, "zero-length aperture translation");
    if is_live() {
        assert!(
            phys.as_u64() + length <= layout::PHYS_APERTURE_SIZE,
            "physical range {phys}+{length:#x} exceeds the aperture"
        );
        VirtAddr::new(layout::PHYS_APERTURE_START + phys.as_u64())
    } else {
        assert!(
            phys.as_u64() + length <= EARLY_BOOT_LIMIT,
            "physical range {phys}+{length:#x} outside the early-boot identity map"
        );
        VirtAddr::new(phys.as_u64())
    }
}

/// Releases a translation obtained from [`phys_to_virt`].
///
/// The aperture is permanent, so this is a no-op; it exists so callers can
/// bracket their usage symmetrically.
pub fn release(_virt: VirtAddr, _length: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_window_translates_in_place() {
        let aperture = PhysAperture::identity();
        assert_eq!(aperture.translate(PhysAddr::new(0x1000)), 0x1000);
    }

    #[test]
    fn live_window_offsets_by_aperture_base() {
        let aperture = PhysAperture::live();
        assert_eq!(
            aperture.translate(PhysAddr::new(0x20_0000)),
            layout::PHYS_APERTURE_START + 0x20_0000
        );
    }

    #[test]
    fn window_reads_and_writes_host_memory() {
        let mut buf = [0u64; 8];
        let aperture = PhysAperture::at_offset(buf.as_mut_ptr() as u64);
        let window = aperture.window(PhysAddr::zero());
        window.write_u64(3, 0xDEAD_BEEF);
        assert_eq!(window.read_u64(3), 0xDEAD_BEEF);
        assert_eq!(buf[3], 0xDEAD_BEEF);
        window.zero(core::mem::size_of_val(&buf));
        assert_eq!(buf[3], 0);
    }

    #[test]
    fn install_flag_claimed_once() {
        let flag = ApertureInstallFlag::new();
        assert!(!flag.is_claimed());
        assert!(flag.try_claim());
        assert!(!flag.try_claim());
        assert!(flag.is_claimed());
    }

    // The process-wide LIVE flag is never set on the host, so the global
    // translation stays in its early-boot identity mode for all tests.

    #[test]
    fn early_boot_translation_is_identity() {
        assert!(!is_live());
        let virt = phys_to_virt(PhysAddr::new(0x10_0000), 0x1000);
        assert_eq!(virt.as_u64(), 0x10_0000);
        release(virt, 0x1000); // no-op by contract
    }

    #[test]
    #[should_panic(expected = "early-boot identity map")]
    fn early_boot_translation_rejects_high_memory() {
        let _ = phys_to_virt(PhysAddr::new(0x1_0000_0000), 0x1000);
    }

    #[test]
    fn current_window_matches_boot_phase() {
        assert_eq!(current(), PhysAperture::identity());
    }
}

//! The physical frame allocator.
//!
//! Frames are handed out from *pools*; each pool owns up to
//! [`MAX_REGIONS_PER_POOL`] *regions*, contiguous physical ranges tracked by
//! a bitmap stored in the first frames of the region itself. Keeping the
//! bitmap in-region means the allocator needs no other allocator to hold its
//! own metadata, which is what lets it run first at boot.
//!
//! Bitmap words are updated with atomic read-modify-write operations, so
//! allocation and free are safe from any CPU and never block. Bit semantics:
//! a set bit means the frame is free.
//!
//! The allocator itself, its pools, and the region arena all live in static
//! kernel memory.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::sync::SpinLock;

use crate::aperture::PhysAperture;
use crate::page_table::{AddressSpace, MapError};
use crate::vm_object::{MapEntry, Mode};
use crate::layout;

/// Maximum number of pools, including the default pool 0.
pub const MAX_POOLS: usize = 8;
/// Maximum regions per pool.
pub const MAX_REGIONS_PER_POOL: usize = 16;
/// Maximum regions system-wide. The arena is preallocated in static memory.
pub const MAX_GLOBAL_REGIONS: usize = 48;
/// Maximum number of extra (large) page sizes.
pub const MAX_EXTRA_SIZES: usize = 4;

const BITS_PER_WORD: usize = 64;

/// Errors adding a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// The target pool already holds its maximum number of regions.
    PoolFull,
    /// The global region arena is exhausted.
    ArenaExhausted,
    /// The region cannot hold its own bitmap plus at least one allocatable
    /// frame.
    TooSmall,
}

impl core::fmt::Display for RegionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PoolFull => write!(f, "pool cannot accept any more regions"),
            Self::ArenaExhausted => write!(f, "global region arena exhausted"),
            Self::TooSmall => write!(f, "region too small for bitmap plus one frame"),
        }
    }
}

/// Errors allocating frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The pool has no free frame left.
    OutOfFrames,
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
        }
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// A contiguous physical range whose free frames are tracked by an in-region
/// bitmap.
///
/// The first `metadata_bytes` of the range hold the bitmap and are
/// permanently reserved; allocatable frames start at `alloc_base`.
pub struct Region {
    phys_base: PhysAddr,
    num_frames: usize,
    metadata_bytes: u64,
    alloc_base: PhysAddr,
    alloc_frames: usize,
    /// Bitmap words, reached through the aperture (or, after
    /// [`rebind_bitmap`](Self::rebind_bitmap), through the metadata window).
    bitmap: *const AtomicU64,
    bitmap_words: usize,
    /// Frames currently handed out.
    allocated: AtomicUsize,
}

// SAFETY: The bitmap pointer refers to physical memory owned by this region
// for the kernel's lifetime, and all access to it is atomic.
unsafe impl Send for Region {}
// SAFETY: See above; shared access only touches atomics.
unsafe impl Sync for Region {}

impl Region {
    /// Initializes a region covering `length` bytes at `phys_base`, writing
    /// its bitmap into the region's own first frames through `aperture`.
    ///
    /// # Safety
    ///
    /// The physical range must be real, unused RAM reachable through
    /// `aperture`, and must not be handed to any other region.
    unsafe fn new(
        aperture: PhysAperture,
        frame_size: u64,
        phys_base: PhysAddr,
        length: u64,
    ) -> Result<Self, RegionError> {
        let num_frames = (length / frame_size) as usize;
        let bitmap_bytes = num_frames.div_ceil(8) as u64;
        let bitmap_frames = bitmap_bytes.div_ceil(frame_size);
        let metadata_bytes = bitmap_frames * frame_size;

        if num_frames <= bitmap_frames as usize {
            return Err(RegionError::TooSmall);
        }
        let alloc_frames = num_frames - bitmap_frames as usize;
        let bitmap_words = alloc_frames.div_ceil(BITS_PER_WORD);

        let window = aperture.window(phys_base);
        // SAFETY: The caller guarantees the range; the bitmap occupies the
        // reserved metadata frames at the start of the region.
        let bitmap = unsafe { window.as_atomic_words(bitmap_words) };

        // Every allocatable frame starts out free; bits past the end of the
        // last word stay zero so they are never handed out.
        for (i, word) in bitmap.iter().enumerate() {
            let bits_before = i * BITS_PER_WORD;
            let bits_here = (alloc_frames - bits_before).min(BITS_PER_WORD);
            let value = if bits_here == BITS_PER_WORD {
                u64::MAX
            } else {
                (1u64 << bits_here) - 1
            };
            word.store(value, Ordering::Relaxed);
        }

        Ok(Self {
            phys_base,
            num_frames,
            metadata_bytes,
            alloc_base: phys_base + metadata_bytes,
            alloc_frames,
            bitmap: bitmap.as_ptr(),
            bitmap_words,
            allocated: AtomicUsize::new(0),
        })
    }

    fn bitmap(&self) -> &[AtomicU64] {
        // SAFETY: Established at construction (or rebind): `bitmap_words`
        // atomics live at `bitmap` for the kernel's lifetime.
        unsafe { core::slice::from_raw_parts(self.bitmap, self.bitmap_words) }
    }

    /// Points the bitmap accessor at a new virtual address after the bitmap
    /// frames have been re-mapped there.
    ///
    /// # Safety
    ///
    /// `virt` must map exactly the region's metadata frames, writable, in
    /// the address space the kernel is running on.
    unsafe fn rebind_bitmap(&mut self, virt: VirtAddr) {
        self.bitmap = virt.as_ptr::<AtomicU64>();
    }

    /// Allocates up to `out.len()` frames from this region, returning how
    /// many were placed.
    ///
    /// Scans the bitmap a word at a time, skipping empty words, and claims
    /// bits with compare-and-swap so concurrent callers never double-allocate.
    fn alloc(&self, frame_size: u64, out: &mut [PhysAddr]) -> usize {
        let mut satisfied = 0;

        for (wi, word) in self.bitmap().iter().enumerate() {
            let mut val = word.load(Ordering::Relaxed);
            if val == 0 {
                continue;
            }

            let chunk_base = self.alloc_base.as_u64() + (wi * BITS_PER_WORD) as u64 * frame_size;

            while val != 0 && satisfied < out.len() {
                let bit = val.trailing_zeros();
                match word.compare_exchange_weak(
                    val,
                    val & !(1 << bit),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        out[satisfied] = PhysAddr::new(chunk_base + u64::from(bit) * frame_size);
                        satisfied += 1;
                        self.allocated.fetch_add(1, Ordering::Relaxed);
                        val &= !(1 << bit);
                    }
                    Err(current) => val = current,
                }
            }

            if satisfied == out.len() {
                break;
            }
        }

        satisfied
    }

    /// Frees every address in `addrs` that belongs to this region, returning
    /// how many were freed. Foreign addresses are skipped; the pool tries
    /// its other regions with them.
    fn free(&self, frame_size: u64, addrs: &[PhysAddr]) -> usize {
        let mut freed = 0;

        for &addr in addrs {
            if !self.contains(frame_size, addr) {
                continue;
            }
            let index = ((addr - self.alloc_base) / frame_size) as usize;
            self.bitmap()[index / BITS_PER_WORD]
                .fetch_or(1 << (index % BITS_PER_WORD), Ordering::Relaxed);
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            freed += 1;
        }

        freed
    }

    /// Whether `addr` is an allocatable frame of this region.
    fn contains(&self, frame_size: u64, addr: PhysAddr) -> bool {
        addr >= self.alloc_base
            && addr.as_u64() < self.phys_base.as_u64() + self.num_frames as u64 * frame_size
    }

    /// Number of allocatable frames.
    pub fn total_frames(&self) -> usize {
        self.alloc_frames
    }

    /// Frames currently handed out.
    pub fn allocated_frames(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Free frames according to the bitmap population count.
    pub fn free_frames(&self) -> usize {
        self.bitmap()
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Physical base of the region (the start of its bitmap).
    pub fn phys_base(&self) -> PhysAddr {
        self.phys_base
    }

    /// Bytes reserved at the start of the region for the bitmap.
    pub fn metadata_bytes(&self) -> u64 {
        self.metadata_bytes
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// An allocation policy domain: a fixed list of region arena indices,
/// scanned in order.
struct Pool {
    regions: [Option<usize>; MAX_REGIONS_PER_POOL],
}

impl Pool {
    const fn new() -> Self {
        Self {
            regions: [None; MAX_REGIONS_PER_POOL],
        }
    }

    fn attach(&mut self, arena_index: usize) -> Result<(), RegionError> {
        for slot in &mut self.regions {
            if slot.is_none() {
                *slot = Some(arena_index);
                return Ok(());
            }
        }
        Err(RegionError::PoolFull)
    }

    fn region_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.regions.iter().map_while(|slot| *slot)
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// The physical allocator: pools, and the arena owning every region.
pub struct PhysicalAllocator {
    frame_size: u64,
    /// Extra page sizes, stored as power-of-two shifts relative to
    /// `frame_size`.
    extra_size_shifts: [u8; MAX_EXTRA_SIZES],
    num_extra_sizes: usize,
    pools: [Pool; MAX_POOLS],
    pool_count: usize,
    regions: [Option<Region>; MAX_GLOBAL_REGIONS],
    region_count: usize,
    aperture: PhysAperture,
}

impl PhysicalAllocator {
    /// Creates an allocator with the default pool plus `bonus_pools` more.
    ///
    /// # Panics
    ///
    /// Panics if `frame_size` is not a power of two, any extra size is not a
    /// power of two strictly greater than `frame_size`, too many extra sizes
    /// are given, or the pool count exceeds [`MAX_POOLS`]. These are kernel
    /// configuration errors, not runtime conditions.
    pub fn new(
        frame_size: u64,
        extra_sizes: &[u64],
        bonus_pools: usize,
        aperture: PhysAperture,
    ) -> Self {
        assert!(
            frame_size.is_power_of_two(),
            "frame size {frame_size:#x} is not a power of two"
        );
        assert!(
            extra_sizes.len() <= MAX_EXTRA_SIZES,
            "too many extra page sizes (max {MAX_EXTRA_SIZES}, got {})",
            extra_sizes.len()
        );
        let pool_count = 1 + bonus_pools;
        assert!(pool_count <= MAX_POOLS, "too many pools");

        let base_shift = frame_size.trailing_zeros() as u8;
        let mut extra_size_shifts = [0u8; MAX_EXTRA_SIZES];
        for (i, &size) in extra_sizes.iter().enumerate() {
            assert!(
                size.is_power_of_two() && size > frame_size,
                "extra page size {size:#x} must be a power of two above the frame size"
            );
            extra_size_shifts[i] = size.trailing_zeros() as u8 - base_shift;
        }

        Self {
            frame_size,
            extra_size_shifts,
            num_extra_sizes: extra_sizes.len(),
            pools: [const { Pool::new() }; MAX_POOLS],
            pool_count,
            regions: [const { None }; MAX_GLOBAL_REGIONS],
            region_count: 0,
            aperture,
        }
    }

    /// The standard frame size.
    pub fn frame_size(&self) -> u64 {
        self.frame_size
    }

    /// The registered extra page sizes, in bytes.
    pub fn extra_sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.extra_size_shifts[..self.num_extra_sizes]
            .iter()
            .map(move |&shift| self.frame_size << shift)
    }

    /// Adds a physical region to a pool. Boot-time only.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `length` is not frame-aligned, `length` is zero,
    /// or `pool` is out of range (kernel-caller contract).
    ///
    /// # Safety
    ///
    /// The range must be real, unused RAM reachable through this allocator's
    /// aperture, and must not overlap any other region.
    pub unsafe fn add_region(
        &mut self,
        base: PhysAddr,
        length: u64,
        pool: usize,
    ) -> Result<(), RegionError> {
        assert!(base.is_aligned(self.frame_size), "unaligned region base {base}");
        assert!(
            length != 0 && length % self.frame_size == 0,
            "unaligned region length {length:#x}"
        );
        assert!(pool < self.pool_count, "pool index {pool} out of range");

        if self.region_count >= MAX_GLOBAL_REGIONS {
            return Err(RegionError::ArenaExhausted);
        }

        // SAFETY: Forwarded from the caller.
        let region = unsafe { Region::new(self.aperture, self.frame_size, base, length)? };

        self.pools[pool].attach(self.region_count)?;
        self.regions[self.region_count] = Some(region);
        self.region_count += 1;
        Ok(())
    }

    /// Allocates up to `count` frames from `pool` into `out`, scanning the
    /// pool's regions in order. Returns how many frames were placed, which
    /// may be less than `count` when the pool is fragmented or short.
    ///
    /// # Panics
    ///
    /// Panics if `pool` is out of range or `out` cannot hold `count`
    /// addresses (kernel-caller contract).
    pub fn allocate_pages(&self, count: usize, out: &mut [PhysAddr], pool: usize) -> usize {
        assert!(pool < self.pool_count, "pool index {pool} out of range");
        assert!(out.len() >= count, "output buffer too small");
        if count == 0 {
            return 0;
        }

        let mut placed = 0;
        for index in self.pools[pool].region_indices() {
            let region = self.regions[index].as_ref().expect("pool references live region");
            placed += region.alloc(self.frame_size, &mut out[placed..count]);
            if placed == count {
                break;
            }
        }
        placed
    }

    /// Allocates a single frame from `pool`.
    pub fn allocate_frame(&self, pool: usize) -> Result<PhysAddr, AllocError> {
        let mut out = [PhysAddr::zero()];
        if self.allocate_pages(1, &mut out, pool) == 1 {
            Ok(out[0])
        } else {
            Err(AllocError::OutOfFrames)
        }
    }

    /// Frees every address in `addrs` that falls inside one of `pool`'s
    /// regions; addresses outside the pool are silently ignored so callers
    /// need not track which region an address came from. Returns the number
    /// of frames freed.
    ///
    /// # Panics
    ///
    /// Panics if `pool` is out of range.
    pub fn free_pages(&self, addrs: &[PhysAddr], pool: usize) -> usize {
        assert!(pool < self.pool_count, "pool index {pool} out of range");

        let mut freed = 0;
        for index in self.pools[pool].region_indices() {
            let region = self.regions[index].as_ref().expect("pool references live region");
            freed += region.free(self.frame_size, addrs);
            if freed == addrs.len() {
                break;
            }
        }
        freed
    }

    /// Total allocatable frames in `pool`.
    pub fn total_frames(&self, pool: usize) -> usize {
        self.pools[pool]
            .region_indices()
            .map(|i| self.regions[i].as_ref().map_or(0, Region::total_frames))
            .sum()
    }

    /// Frames of `pool` currently handed out.
    pub fn allocated_frames(&self, pool: usize) -> usize {
        self.pools[pool]
            .region_indices()
            .map(|i| self.regions[i].as_ref().map_or(0, Region::allocated_frames))
            .sum()
    }

    /// Free frames in `pool`, counted from the bitmaps.
    pub fn free_frames(&self, pool: usize) -> usize {
        self.pools[pool]
            .region_indices()
            .map(|i| self.regions[i].as_ref().map_or(0, Region::free_frames))
            .sum()
    }

    /// Re-addresses every region bitmap from its boot-time aperture window
    /// into the dedicated allocator-metadata region of `space`, mapping the
    /// bitmap frames there and swapping each region's accessor over.
    ///
    /// Must run before `space` is activated: the mappings it creates are what
    /// keep the bitmaps reachable once the bootloader's identity map is gone.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, on the kernel address space, before any
    /// CPU runs on `space` without the boot identity map.
    pub unsafe fn apply_virtual_map(&mut self, space: &AddressSpace) -> Result<(), MapError> {
        let mut cursor = layout::PHYS_ALLOC_METADATA_START;

        for i in 0..self.region_count {
            let (bitmap_phys, metadata_bytes) = {
                let region = self.regions[i].as_ref().expect("arena slot populated");
                (region.phys_base(), region.metadata_bytes())
            };
            assert!(
                cursor + metadata_bytes - 1 <= layout::PHYS_ALLOC_METADATA_END,
                "allocator metadata window exhausted"
            );

            let entry = MapEntry::contiguous(bitmap_phys, metadata_bytes, Mode::KernelRW);
            {
                // Intermediate table frames come from this allocator itself;
                // the bitmaps are still reachable through the old window
                // while the new mappings are written.
                let this: &Self = self;
                let mut alloc = || this.allocate_frame(0).ok();
                entry.added_to(VirtAddr::new(cursor), space, &mut alloc)?;
            }

            let region = self.regions[i].as_mut().expect("arena slot populated");
            // SAFETY: The metadata frames were just mapped at `cursor` in the
            // address space the kernel is about to run on.
            unsafe { region.rebind_bitmap(VirtAddr::new(cursor)) };
            cursor += metadata_bytes;
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Global allocator singleton
// ---------------------------------------------------------------------------

/// The process-wide allocator. Lives in static kernel memory so it works
/// before any other allocator exists.
static PHYS: SpinLock<Option<PhysicalAllocator>> = SpinLock::new(None);

/// Initializes the global allocator. Must be called exactly once, before any
/// allocation.
///
/// # Panics
///
/// Panics on re-initialization or invalid sizes.
pub fn init(frame_size: u64, extra_sizes: &[u64], bonus_pools: usize) {
    let allocator =
        PhysicalAllocator::new(frame_size, extra_sizes, bonus_pools, crate::aperture::current());
    let mut phys = PHYS.lock();
    assert!(phys.is_none(), "cannot re-initialize physical allocator");
    *phys = Some(allocator);
}

/// Runs `f` with the global allocator.
///
/// # Panics
///
/// Panics if the allocator has not been initialized.
pub fn with<R>(f: impl FnOnce(&mut PhysicalAllocator) -> R) -> R {
    let mut phys = PHYS.lock();
    f(phys.as_mut().expect("physical allocator not initialized"))
}

/// Runs `f` with the global allocator unless its lock is held or it is not
/// initialized. For fault and panic paths.
pub fn try_with<R>(f: impl FnOnce(&mut PhysicalAllocator) -> R) -> Option<R> {
    let mut phys = PHYS.try_lock()?;
    Some(f(phys.as_mut()?))
}

/// Adds a region to the global allocator. Boot-time only.
///
/// # Safety
///
/// As for [`PhysicalAllocator::add_region`].
pub unsafe fn add_region(base: PhysAddr, length: u64, pool: usize) -> Result<(), RegionError> {
    with(|a| unsafe { a.add_region(base, length, pool) })
}

/// Allocates up to `count` frames into `out` from the global allocator.
pub fn allocate_pages(count: usize, out: &mut [PhysAddr], pool: usize) -> usize {
    with(|a| a.allocate_pages(count, out, pool))
}

/// Allocates a single frame from the global allocator.
pub fn allocate_frame(pool: usize) -> Result<PhysAddr, AllocError> {
    with(|a| a.allocate_frame(pool))
}

/// Frees frames through the global allocator.
pub fn free_pages(addrs: &[PhysAddr], pool: usize) -> usize {
    with(|a| a.free_pages(addrs, pool))
}

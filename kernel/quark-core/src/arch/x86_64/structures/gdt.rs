//! Global Descriptor Table structures.
//!
//! The GDT is a fixed 64-slot table with a frozen layout: slot 0 is the null
//! descriptor, slots 1..=5 are the kernel/user code and data segments, and
//! slots from [`FIRST_TSS_SLOT`] up hold TSS descriptors, two slots each.

use core::mem::size_of;

/// Number of 8-byte descriptor slots in the GDT.
pub const GDT_SLOTS: usize = 64;

/// Slot of the 64-bit kernel code segment.
pub const KERNEL_CODE_SLOT: usize = 1;
/// Slot of the kernel data segment.
pub const KERNEL_DATA_SLOT: usize = 2;
/// Slot of the 32-bit user code segment (compatibility mode).
pub const USER_CODE32_SLOT: usize = 3;
/// Slot of the 64-bit user code segment.
pub const USER_CODE64_SLOT: usize = 4;
/// Slot of the user data segment.
pub const USER_DATA_SLOT: usize = 5;
/// First slot available for TSS descriptors. Each TSS occupies two slots.
pub const FIRST_TSS_SLOT: usize = 6;

/// Byte offset of the first TSS descriptor within the table.
pub const FIRST_TSS_OFFSET: usize = FIRST_TSS_SLOT * 8;

/// Bit positions shared by selectors and descriptors.
mod segment_bits {
    /// Shift converting a GDT slot index to a selector (skips TI and RPL).
    pub const SELECTOR_INDEX_SHIFT: u16 = 3;
    /// Mask of the 2-bit requested privilege level.
    pub const RPL_MASK: u16 = 0b11;
    /// Bit position of the DPL field in a descriptor.
    pub const DPL_SHIFT: u64 = 45;
    /// Mask of the 2-bit DPL field (after shifting).
    pub const DPL_MASK: u64 = 0b11;
}

/// A segment selector value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl SegmentSelector {
    /// Creates a selector from a GDT slot index and requested privilege
    /// level.
    #[inline]
    pub const fn new(index: u16, rpl: u16) -> Self {
        Self((index << segment_bits::SELECTOR_INDEX_SHIFT) | (rpl & segment_bits::RPL_MASK))
    }

    /// Creates a selector from a raw `u16`.
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw `u16` value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the GDT slot index.
    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> segment_bits::SELECTOR_INDEX_SHIFT
    }

    /// Returns the requested privilege level.
    #[inline]
    pub const fn rpl(self) -> u16 {
        self.0 & segment_bits::RPL_MASK
    }
}

/// Selector for the kernel code segment.
pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(KERNEL_CODE_SLOT as u16, 0);
/// Selector for the kernel data segment.
pub const KERNEL_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(KERNEL_DATA_SLOT as u16, 0);
/// Selector for the 32-bit user code segment.
pub const USER_CODE32_SELECTOR: SegmentSelector = SegmentSelector::new(USER_CODE32_SLOT as u16, 3);
/// Selector for the 64-bit user code segment.
pub const USER_CODE64_SELECTOR: SegmentSelector = SegmentSelector::new(USER_CODE64_SLOT as u16, 3);
/// Selector for the user data segment.
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(USER_DATA_SLOT as u16, 3);

/// Returns the selector of the `index`-th TSS descriptor.
#[inline]
pub const fn tss_selector(index: usize) -> SegmentSelector {
    SegmentSelector::new((FIRST_TSS_SLOT + index * 2) as u16, 0)
}

/// A descriptor value ready to be written into the table.
#[derive(Debug, Clone, Copy)]
pub enum Descriptor {
    /// An ordinary 8-byte code/data descriptor.
    UserSegment(u64),
    /// A 16-byte system descriptor (TSS); low and high halves.
    SystemSegment(u64, u64),
}

impl Descriptor {
    /// 64-bit kernel code: L=1, P=1, DPL=0, execute/read.
    #[inline]
    pub const fn kernel_code_segment() -> Self {
        Self::UserSegment(0x00AF_9A00_0000_FFFF)
    }

    /// Kernel data: P=1, DPL=0, read/write.
    #[inline]
    pub const fn kernel_data_segment() -> Self {
        Self::UserSegment(0x00CF_9200_0000_FFFF)
    }

    /// 32-bit user code: D=1, P=1, DPL=3, execute/read. Used for
    /// compatibility-mode userspace.
    #[inline]
    pub const fn user_code32_segment() -> Self {
        Self::UserSegment(0x00CF_FA00_0000_FFFF)
    }

    /// 64-bit user code: L=1, P=1, DPL=3, execute/read.
    #[inline]
    pub const fn user_code64_segment() -> Self {
        Self::UserSegment(0x00AF_FA00_0000_FFFF)
    }

    /// User data: P=1, DPL=3, read/write.
    #[inline]
    pub const fn user_data_segment() -> Self {
        Self::UserSegment(0x00CF_F200_0000_FFFF)
    }

    /// Descriptor type of an available 64-bit TSS.
    const TSS_TYPE_AVAILABLE_64: u64 = 0x9;
    /// Bit position of the present flag.
    const PRESENT_BIT: u64 = 47;

    /// Builds a 16-byte TSS descriptor pointing at `tss`.
    pub fn tss_segment(tss: &'static TaskStateSegment) -> Self {
        let base = tss as *const _ as u64;
        let limit = (size_of::<TaskStateSegment>() - 1) as u64;

        // Low half:
        //  bits  0..15: limit[0..15]
        //  bits 16..39: base[0..23]
        //  bits 40..43: type (0x9 = available 64-bit TSS)
        //  bit      44: 0 (system segment)
        //  bits 45..46: DPL
        //  bit      47: present
        //  bits 48..51: limit[16..19]
        //  bits 56..63: base[24..31]
        let low = (limit & 0xFFFF)
            | ((base & 0xFF_FFFF) << 16)
            | (Self::TSS_TYPE_AVAILABLE_64 << 40)
            | (1 << Self::PRESENT_BIT)
            | ((limit & 0xF_0000) << 32)
            | ((base & 0xFF00_0000) << 32);

        // High half: base[32..63], rest reserved.
        let high = base >> 32;

        Self::SystemSegment(low, high)
    }

    /// Returns the DPL encoded in this descriptor.
    fn privilege_level(&self) -> u16 {
        let low = match self {
            Self::UserSegment(bits) => *bits,
            Self::SystemSegment(bits, _) => *bits,
        };
        ((low >> segment_bits::DPL_SHIFT) & segment_bits::DPL_MASK) as u16
    }
}

/// Pointer operand for LGDT / LIDT.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    /// Table size in bytes, minus one.
    pub limit: u16,
    /// Linear base address of the table.
    pub base: u64,
}

/// The Global Descriptor Table: 64 fixed slots.
#[repr(C, align(64))]
pub struct Gdt {
    slots: [u64; GDT_SLOTS],
}

impl Gdt {
    /// Creates a zeroed table. Slot 0 stays zero forever (null descriptor).
    pub const fn new() -> Self {
        Self {
            slots: [0; GDT_SLOTS],
        }
    }

    /// Writes `descriptor` at `slot` and returns the matching selector.
    ///
    /// # Panics
    ///
    /// Panics on slot 0, out-of-range slots, or a system segment whose second
    /// half would fall outside the table.
    pub fn set_descriptor(&mut self, slot: usize, descriptor: Descriptor) -> SegmentSelector {
        assert!(slot != 0, "GDT slot 0 is the null descriptor");
        let rpl = descriptor.privilege_level();

        match descriptor {
            Descriptor::UserSegment(bits) => {
                assert!(slot < GDT_SLOTS, "GDT slot {slot} out of range");
                self.slots[slot] = bits;
            }
            Descriptor::SystemSegment(low, high) => {
                assert!(
                    slot + 1 < GDT_SLOTS,
                    "GDT slot {slot} out of range for a system segment"
                );
                self.slots[slot] = low;
                self.slots[slot + 1] = high;
            }
        }

        SegmentSelector::new(slot as u16, rpl)
    }

    /// Installs `tss` as the `index`-th TSS descriptor (two slots starting at
    /// [`FIRST_TSS_SLOT`]) and returns its selector.
    pub fn install_tss(&mut self, index: usize, tss: &'static TaskStateSegment) -> SegmentSelector {
        let slot = FIRST_TSS_SLOT + index * 2;
        self.set_descriptor(slot, Descriptor::tss_segment(tss));
        tss_selector(index)
    }

    /// Returns the raw value at `slot`.
    pub fn slot(&self, slot: usize) -> u64 {
        self.slots[slot]
    }

    /// The LGDT limit for a table holding `num_tss` installed TSS
    /// descriptors: the segments plus `16 * num_tss` TSS bytes, minus one.
    pub const fn lgdt_limit(num_tss: usize) -> u16 {
        (FIRST_TSS_OFFSET + num_tss * 16 - 1) as u16
    }

    /// Loads this table into the processor (LGDT).
    ///
    /// The limit only spans the populated slots, so stray far pointers into
    /// the unused tail fault instead of loading garbage.
    ///
    /// # Safety
    ///
    /// - `self` must stay in place as long as it is loaded (hence `'static`).
    /// - All populated descriptors must be valid; segment registers must be
    ///   reloaded afterwards.
    pub unsafe fn load(&'static self, num_tss: usize) {
        assert!(num_tss >= 1, "at least the BSP TSS must be installed");
        assert!(
            FIRST_TSS_SLOT + num_tss * 2 <= GDT_SLOTS,
            "too many TSS descriptors for the table"
        );

        let ptr = DescriptorTablePointer {
            limit: Self::lgdt_limit(num_tss),
            base: self.slots.as_ptr() as u64,
        };
        unsafe {
            core::arch::asm!(
                "lgdt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags),
            );
        }
    }
}

/// The 64-bit Task State Segment.
///
/// Only the interrupt stack table and RSP0 matter to this kernel; everything
/// else is zero. The I/O permission bitmap offset points past the end of the
/// structure so no bitmap is ever consulted.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    _reserved_0: u32,
    /// RSP0..RSP2, switched to on ring transitions.
    pub privilege_stack_table: [u64; 3],
    _reserved_1: u64,
    /// IST1..IST7. An IDT gate selecting IST *n* makes the CPU switch to
    /// `interrupt_stack_table[n - 1]` on entry.
    pub interrupt_stack_table: [u64; 7],
    _reserved_2: u64,
    _reserved_3: u16,
    /// Offset from the TSS base to the I/O permission bitmap.
    pub iomap_base: u16,
}

impl TaskStateSegment {
    /// Creates a TSS with all stacks zeroed and the I/O bitmap disabled
    /// (offset pointing one past the end of the structure).
    pub const fn new() -> Self {
        Self {
            _reserved_0: 0,
            privilege_stack_table: [0; 3],
            _reserved_1: 0,
            interrupt_stack_table: [0; 7],
            _reserved_2: 0,
            _reserved_3: 0,
            iomap_base: (size_of::<Self>() - 1) as u16,
        }
    }
}

impl Default for TaskStateSegment {
    fn default() -> Self {
        Self::new()
    }
}

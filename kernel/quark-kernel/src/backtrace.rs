//! Call-chain walking and symbolication for diagnostics.
//!
//! The walker follows the `{saved_rbp, return_rip}` chain the compiler lays
//! down under `force-frame-pointers`, refusing to follow anything that does
//! not look like a kernel stack address. Return addresses inside the kernel
//! text range are resolved against the symbol table of the kernel ELF image
//! the bootloader left us; anything else prints as a bare hex address.

use core::fmt::Write;

use quark_core::arch::x86_64::instructions::read_frame_pointer;
use quark_core::arch::x86_64::structures::trap_frame::TrapFrame;
use quark_core::sync::SpinLock;
use quark_core::{kprint, kprintln};
use quark_mm::layout;

use crate::boot::KernelFileInfo;
use crate::config::BACKTRACE_MAX_FRAMES;

/// Captured return addresses, innermost first.
pub struct FrameBuffer {
    addrs: [u64; BACKTRACE_MAX_FRAMES],
    len: usize,
}

impl FrameBuffer {
    const fn empty() -> Self {
        Self {
            addrs: [0; BACKTRACE_MAX_FRAMES],
            len: 0,
        }
    }

    /// The captured return addresses.
    pub fn frames(&self) -> &[u64] {
        &self.addrs[..self.len]
    }
}

/// Whether `rbp` may be followed as a frame pointer: nonzero, aligned, and
/// in kernel space (high bit set).
fn plausible_frame_ptr(rbp: u64) -> bool {
    rbp != 0 && rbp & (1 << 63) != 0 && rbp & 0x7 == 0
}

/// Walks the frame chain starting at `rbp`.
///
/// # Safety
///
/// Every address passing [`plausible_frame_ptr`] along the chain must be
/// mapped readable; the walk trusts the chain the compiler built.
pub unsafe fn capture_from(mut rbp: u64) -> FrameBuffer {
    let mut buf = FrameBuffer::empty();
    let mut prev = 0u64;

    while buf.len < BACKTRACE_MAX_FRAMES {
        if !plausible_frame_ptr(rbp) || rbp == prev {
            break;
        }
        // SAFETY: Validated above; per the caller's contract the frame is
        // readable. Layout: [rbp] = caller's rbp, [rbp+8] = return address.
        let (next, ret) = unsafe {
            let p = rbp as *const u64;
            (p.read(), p.add(1).read())
        };
        if ret != 0 {
            buf.addrs[buf.len] = ret;
            buf.len += 1;
        }
        prev = rbp;
        rbp = next;
    }

    buf
}

/// Captures the chain from the current frame pointer.
pub fn capture_current() -> FrameBuffer {
    // SAFETY: Walking our own kernel stack, which is mapped.
    unsafe { capture_from(read_frame_pointer()) }
}

/// Captures the chain of the interrupted context in `frame`.
///
/// Returns `None` when the saved frame pointer is not a kernel stack
/// address (a user-space chain cannot be walked from here).
pub fn capture_from_trap(frame: &TrapFrame) -> Option<FrameBuffer> {
    if !plausible_frame_ptr(frame.rbp) {
        return None;
    }
    // SAFETY: The frame pointer was validated as kernel-space.
    Some(unsafe { capture_from(frame.rbp) })
}

// ---------------------------------------------------------------------------
// ELF symbolication
// ---------------------------------------------------------------------------

/// Section type of a symbol table.
const SHT_SYMTAB: u32 = 2;
/// Size of one ELF64 symbol record.
const SYM_ENTRY_SIZE: usize = 24;
/// Size of one ELF64 section header.
const SHDR_SIZE: usize = 64;

/// Symbol table slices located inside the mapped kernel ELF image.
pub struct SymbolTable {
    image: &'static [u8],
    symtab_offset: usize,
    symtab_count: usize,
    strtab_offset: usize,
    strtab_len: usize,
    text_start: u64,
    text_end: u64,
}

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(off..off + 8)?.try_into().ok()?))
}

impl SymbolTable {
    /// Locates `.symtab` and its string table inside an ELF64 image.
    ///
    /// Returns `None` when the image is not ELF64 or carries no symbol
    /// table (a stripped kernel still boots, it just loses symbol names).
    pub fn parse(image: &'static [u8], text_start: u64, text_end: u64) -> Option<Self> {
        if image.get(..4)? != b"\x7FELF" || *image.get(4)? != 2 {
            return None;
        }

        let shoff = read_u64(image, 0x28)? as usize;
        let shentsize = read_u16(image, 0x3A)? as usize;
        let shnum = read_u16(image, 0x3C)? as usize;
        if shentsize < SHDR_SIZE {
            return None;
        }

        for i in 0..shnum {
            let shdr = shoff + i * shentsize;
            if read_u32(image, shdr + 0x04)? != SHT_SYMTAB {
                continue;
            }
            let symtab_offset = read_u64(image, shdr + 0x18)? as usize;
            let symtab_size = read_u64(image, shdr + 0x20)? as usize;
            let strtab_index = read_u32(image, shdr + 0x28)? as usize;

            let strtab_shdr = shoff + strtab_index * shentsize;
            let strtab_offset = read_u64(image, strtab_shdr + 0x18)? as usize;
            let strtab_len = read_u64(image, strtab_shdr + 0x20)? as usize;

            image.get(symtab_offset..symtab_offset + symtab_size)?;
            image.get(strtab_offset..strtab_offset + strtab_len)?;

            return Some(Self {
                image,
                symtab_offset,
                symtab_count: symtab_size / SYM_ENTRY_SIZE,
                strtab_offset,
                strtab_len,
                text_start,
                text_end,
            });
        }

        None
    }

    /// Resolves `pc` to `(symbol name, offset into symbol)`.
    ///
    /// Only addresses inside the kernel text range are attempted.
    pub fn resolve(&self, pc: u64) -> Option<(&'static str, u64)> {
        if pc < self.text_start || pc >= self.text_end {
            return None;
        }

        for i in 0..self.symtab_count {
            let sym = self.symtab_offset + i * SYM_ENTRY_SIZE;
            let value = read_u64(self.image, sym + 8)?;
            let size = read_u64(self.image, sym + 16)?;
            if size == 0 || pc < value || pc >= value + size {
                continue;
            }

            let name_off = read_u32(self.image, sym)? as usize;
            if name_off == 0 || name_off >= self.strtab_len {
                continue;
            }
            let strtab =
                &self.image[self.strtab_offset..self.strtab_offset + self.strtab_len];
            let name_bytes = &strtab[name_off..];
            let end = name_bytes.iter().position(|&b| b == 0)?;
            let name = core::str::from_utf8(&name_bytes[..end]).ok()?;
            return Some((name, pc - value));
        }

        None
    }
}

/// The loaded symbol table, if any.
static SYMBOLS: SpinLock<Option<SymbolTable>> = SpinLock::new(None);

/// Parses and installs the symbol table from an ELF image already in
/// memory. `text_start..text_end` is the kernel text range symbolication is
/// limited to.
pub fn init_symbols(image: &'static [u8], text_start: u64, text_end: u64) {
    match SymbolTable::parse(image, text_start, text_end) {
        Some(table) => {
            let count = table.symtab_count;
            *SYMBOLS.lock() = Some(table);
            quark_core::kinfo!("backtrace: {} symbols loaded", count);
        }
        None => quark_core::kwarn!("backtrace: no symbol table in kernel image"),
    }
}

/// Installs symbols from the kernel file image mapped at the kernel-image
/// window.
pub fn init_symbols_from_image(file: &KernelFileInfo, text_start: u64, text_end: u64) {
    // SAFETY: The VM manager mapped the file image read-only at the window
    // during bring-up, covering `file.len` bytes.
    let image = unsafe {
        core::slice::from_raw_parts(layout::KERNEL_IMAGE_START as *const u8, file.len as usize)
    };
    init_symbols(image, text_start, text_end);
}

/// Writes a backtrace, one frame per line, symbolicating where possible.
pub fn write_backtrace(out: &mut impl Write, frames: &FrameBuffer) -> core::fmt::Result {
    let symbols = SYMBOLS.try_lock();

    for (i, &addr) in frames.frames().iter().enumerate() {
        let resolved = symbols
            .as_deref()
            .and_then(|t| t.as_ref())
            .and_then(|t| t.resolve(addr));
        match resolved {
            Some((name, offset)) => writeln!(out, "{i:3} {addr:016x} {name}+{offset:#x}")?,
            None => writeln!(out, "{i:3} {addr:016x}")?,
        }
    }
    Ok(())
}

/// Logs a backtrace to the kernel console. With a trap frame the walk starts
/// at the interrupted context, otherwise at the current frame.
pub fn log_backtrace(from: Option<&TrapFrame>) {
    let frames = match from {
        Some(frame) => match capture_from_trap(frame) {
            Some(frames) => frames,
            None => {
                kprintln!("backtrace: frame pointer not in kernel space");
                return;
            }
        },
        None => capture_current(),
    };

    if frames.frames().is_empty() {
        kprintln!("backtrace: no frames");
        return;
    }

    kprintln!("backtrace ({} frames):", frames.frames().len());
    struct ConsoleWriter;
    impl Write for ConsoleWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            kprint!("{s}");
            Ok(())
        }
    }
    let _ = write_backtrace(&mut ConsoleWriter, &frames);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_pointer_plausibility() {
        assert!(!plausible_frame_ptr(0));
        assert!(!plausible_frame_ptr(0x7FFF_FFFF_F000)); // user space
        assert!(!plausible_frame_ptr(0xFFFF_8000_0000_0001)); // unaligned
        assert!(plausible_frame_ptr(0xFFFF_8000_0000_0008));
    }

    #[test]
    fn trap_frame_with_user_rbp_refused() {
        let mut frame = TrapFrame::zeroed();
        frame.rbp = 0x0000_7FFF_0000_0000;
        assert!(capture_from_trap(&frame).is_none());
    }

    /// Builds a minimal ELF64 image: header, two section headers (symtab and
    /// strtab), one function symbol `kmain` at 0xFFFF_FFFF_8000_1000 with
    /// size 0x100.
    fn synthetic_elf() -> Vec<u8> {
        let mut image = vec![0u8; 0x400];

        // ELF header.
        image[..4].copy_from_slice(b"\x7FELF");
        image[4] = 2; // ELFCLASS64
        let shoff: u64 = 0x40;
        image[0x28..0x30].copy_from_slice(&shoff.to_le_bytes());
        image[0x3A..0x3C].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        image[0x3C..0x3E].copy_from_slice(&2u16.to_le_bytes());

        // Section 0: symtab at 0x200, one entry, strtab is section 1.
        let sh0 = shoff as usize;
        image[sh0 + 0x04..sh0 + 0x08].copy_from_slice(&SHT_SYMTAB.to_le_bytes());
        image[sh0 + 0x18..sh0 + 0x20].copy_from_slice(&0x200u64.to_le_bytes());
        image[sh0 + 0x20..sh0 + 0x28].copy_from_slice(&(SYM_ENTRY_SIZE as u64).to_le_bytes());
        image[sh0 + 0x28..sh0 + 0x2C].copy_from_slice(&1u32.to_le_bytes());

        // Section 1: strtab at 0x300, 16 bytes.
        let sh1 = sh0 + SHDR_SIZE;
        image[sh1 + 0x04..sh1 + 0x08].copy_from_slice(&3u32.to_le_bytes());
        image[sh1 + 0x18..sh1 + 0x20].copy_from_slice(&0x300u64.to_le_bytes());
        image[sh1 + 0x20..sh1 + 0x28].copy_from_slice(&16u64.to_le_bytes());

        // Symbol: name at strtab+1, value, size.
        let sym = 0x200;
        image[sym..sym + 4].copy_from_slice(&1u32.to_le_bytes());
        image[sym + 4] = 0x12; // GLOBAL | FUNC
        image[sym + 8..sym + 16].copy_from_slice(&0xFFFF_FFFF_8000_1000u64.to_le_bytes());
        image[sym + 16..sym + 24].copy_from_slice(&0x100u64.to_le_bytes());

        // String table: "\0kmain\0".
        image[0x301..0x306].copy_from_slice(b"kmain");

        image
    }

    #[test]
    fn symbol_resolution() {
        let image = synthetic_elf().leak();
        let table =
            SymbolTable::parse(image, 0xFFFF_FFFF_8000_0000, 0xFFFF_FFFF_8100_0000).unwrap();

        assert_eq!(
            table.resolve(0xFFFF_FFFF_8000_1040),
            Some(("kmain", 0x40))
        );
        // Outside the symbol.
        assert_eq!(table.resolve(0xFFFF_FFFF_8000_2000), None);
        // Outside the text range entirely.
        assert_eq!(table.resolve(0x1000), None);
    }

    #[test]
    fn parse_rejects_non_elf() {
        let junk = vec![0u8; 64].leak();
        assert!(SymbolTable::parse(junk, 0, u64::MAX).is_none());
    }

    #[test]
    fn backtrace_formatting_with_and_without_symbols() {
        let image = synthetic_elf().leak();
        let table =
            SymbolTable::parse(image, 0xFFFF_FFFF_8000_0000, 0xFFFF_FFFF_8100_0000).unwrap();
        *SYMBOLS.lock() = Some(table);

        let mut frames = FrameBuffer::empty();
        frames.addrs[0] = 0xFFFF_FFFF_8000_1010; // inside kmain
        frames.addrs[1] = 0xFFFF_8000_0000_4242; // outside text
        frames.len = 2;

        let mut out = String::new();
        write_backtrace(&mut out, &frames).unwrap();
        *SYMBOLS.lock() = None;

        assert!(out.contains("kmain+0x10"), "{out}");
        assert!(out.contains("ffff800000004242"), "{out}");
    }
}

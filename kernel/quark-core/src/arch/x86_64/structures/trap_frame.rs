//! The register snapshot built by the exception stubs.
//!
//! Each stub pushes (in order): a synthetic error code when the CPU did not
//! supply one, the vector number, and the fifteen general-purpose registers.
//! Together with the hardware interrupt frame this forms a [`TrapFrame`],
//! which the dispatcher receives by reference and hands onward.

use core::fmt;

/// Architectural exception vectors.
pub mod vector {
    /// Divide-by-zero (#DE).
    pub const DIVIDE: u8 = 0;
    /// Debug (#DB).
    pub const DEBUG: u8 = 1;
    /// Non-maskable interrupt.
    pub const NMI: u8 = 2;
    /// Breakpoint (#BP).
    pub const BREAKPOINT: u8 = 3;
    /// Overflow (#OF).
    pub const OVERFLOW: u8 = 4;
    /// Bound range exceeded (#BR).
    pub const BOUND_RANGE: u8 = 5;
    /// Invalid opcode (#UD).
    pub const INVALID_OPCODE: u8 = 6;
    /// Device not available (#NM).
    pub const DEVICE_NOT_AVAILABLE: u8 = 7;
    /// Double fault (#DF).
    pub const DOUBLE_FAULT: u8 = 8;
    /// Invalid TSS (#TS).
    pub const INVALID_TSS: u8 = 10;
    /// Segment not present (#NP).
    pub const SEGMENT_NOT_PRESENT: u8 = 11;
    /// Stack segment fault (#SS).
    pub const STACK_SEGMENT: u8 = 12;
    /// General protection fault (#GP).
    pub const GENERAL_PROTECTION: u8 = 13;
    /// Page fault (#PF).
    pub const PAGE_FAULT: u8 = 14;
    /// x87 floating-point exception (#MF).
    pub const X87_FLOATING_POINT: u8 = 16;
    /// Alignment check (#AC).
    pub const ALIGNMENT_CHECK: u8 = 17;
    /// Machine check (#MC).
    pub const MACHINE_CHECK: u8 = 18;
    /// SIMD floating-point exception (#XM).
    pub const SIMD_FLOATING_POINT: u8 = 19;
    /// Virtualization exception (#VE).
    pub const VIRTUALIZATION: u8 = 20;
}

/// Vector-to-name table for diagnostics.
static EXCEPTION_NAMES: &[(u8, &str)] = &[
    (vector::DIVIDE, "Divide-by-zero"),
    (vector::DEBUG, "Debug"),
    (vector::NMI, "Non-maskable interrupt"),
    (vector::BREAKPOINT, "Breakpoint"),
    (vector::OVERFLOW, "Overflow"),
    (vector::BOUND_RANGE, "Bound range exceeded"),
    (vector::INVALID_OPCODE, "Invalid instruction"),
    (vector::DEVICE_NOT_AVAILABLE, "Device unavailable (FPU)"),
    (vector::DOUBLE_FAULT, "Double fault"),
    (vector::INVALID_TSS, "Invalid TSS"),
    (vector::SEGMENT_NOT_PRESENT, "Segment not present"),
    (vector::STACK_SEGMENT, "Invalid stack segment"),
    (vector::GENERAL_PROTECTION, "General protection fault"),
    (vector::PAGE_FAULT, "Page fault"),
    (vector::X87_FLOATING_POINT, "Floating point exception"),
    (vector::ALIGNMENT_CHECK, "Alignment check"),
    (vector::MACHINE_CHECK, "Machine check"),
    (vector::SIMD_FLOATING_POINT, "SIMD float exception"),
    (vector::VIRTUALIZATION, "Virtualization exception"),
];

/// Returns the name of an architectural exception vector, if known.
pub fn exception_name(vec: u8) -> Option<&'static str> {
    EXCEPTION_NAMES
        .iter()
        .find(|(v, _)| *v == vec)
        .map(|(_, name)| *name)
}

/// CPU state captured on the exception stack.
///
/// The field order matches the stub's push sequence exactly: R15 was pushed
/// last so it sits lowest in memory, and the hardware frame (RIP..SS) sits
/// highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    /// General-purpose registers, stub-saved.
    pub r15: u64,
    /// R14.
    pub r14: u64,
    /// R13.
    pub r13: u64,
    /// R12.
    pub r12: u64,
    /// R11.
    pub r11: u64,
    /// R10.
    pub r10: u64,
    /// R9.
    pub r9: u64,
    /// R8.
    pub r8: u64,
    /// Frame pointer at the time of the exception; the backtrace walker
    /// starts here.
    pub rbp: u64,
    /// RDI.
    pub rdi: u64,
    /// RSI.
    pub rsi: u64,
    /// RDX.
    pub rdx: u64,
    /// RCX.
    pub rcx: u64,
    /// RBX.
    pub rbx: u64,
    /// RAX.
    pub rax: u64,
    /// Exception vector number, stub-pushed.
    pub vector: u64,
    /// CPU error code, or zero for vectors that do not push one.
    pub error_code: u64,
    /// Interrupted instruction pointer (hardware frame).
    pub rip: u64,
    /// Interrupted code segment.
    pub cs: u64,
    /// Interrupted RFLAGS.
    pub rflags: u64,
    /// Interrupted stack pointer.
    pub rsp: u64,
    /// Interrupted stack segment.
    pub ss: u64,
}

impl TrapFrame {
    /// A zeroed frame; starting point for synthetic frames in tests.
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Returns `true` if the exception interrupted ring-3 code.
    pub fn from_user_mode(&self) -> bool {
        self.cs & 0b11 != 0
    }

    /// Formats the register dump into `buf`, truncating if it does not fit.
    /// Returns the number of bytes written.
    pub fn format_into(&self, buf: &mut [u8]) -> usize {
        use core::fmt::Write;

        let mut cursor = BufCursor { buf, written: 0 };
        // A full dump always fits a reasonably sized buffer; on truncation
        // the cursor swallows the tail rather than erroring out.
        let _ = write!(cursor, "{self}");
        cursor.written
    }
}

/// `fmt::Write` into a fixed byte buffer, dropping anything past the end.
struct BufCursor<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl fmt::Write for BufCursor<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = self.buf.len() - self.written;
        let take = s.len().min(remaining);
        self.buf[self.written..self.written + take].copy_from_slice(&s.as_bytes()[..take]);
        self.written += take;
        Ok(())
    }
}

impl fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = exception_name(self.vector as u8).unwrap_or("unknown");
        write!(
            f,
            "RAX {:016x} RBX {:016x}\n\
             RCX {:016x} RDX {:016x}\n\
             RSI {:016x} RDI {:016x}\n\
             RBP {:016x}  R8 {:016x}\n\
             \x20R9 {:016x} R10 {:016x}\n\
             R11 {:016x} R12 {:016x}\n\
             R13 {:016x} R14 {:016x}\n\
             R15 {:016x}\n\
             RFLAGS {:016x} Error {:x}:{:x} ({})\n\
             RIP {:04x}:{:016x} RSP {:04x}:{:016x}",
            self.rax,
            self.rbx,
            self.rcx,
            self.rdx,
            self.rsi,
            self.rdi,
            self.rbp,
            self.r8,
            self.r9,
            self.r10,
            self.r11,
            self.r12,
            self.r13,
            self.r14,
            self.r15,
            self.rflags,
            self.vector,
            self.error_code,
            name,
            self.cs,
            self.rip,
            self.ss,
            self.rsp,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> TrapFrame {
        let mut frame = TrapFrame::zeroed();
        frame.rax = 0x1111;
        frame.rbx = 0x2222;
        frame.rcx = 0x3333;
        frame.rdx = 0x4444;
        frame.rsi = 0x5555;
        frame.rdi = 0x6666;
        frame.rbp = 0x7777;
        frame.r8 = 0x8888;
        frame.r9 = 0x9999;
        frame.r10 = 0xAAAA;
        frame.r11 = 0xBBBB;
        frame.r12 = 0xCCCC;
        frame.r13 = 0xDDDD;
        frame.r14 = 0xEEEE;
        frame.r15 = 0xFFFF;
        frame.rflags = 0x202;
        frame.vector = vector::GENERAL_PROTECTION as u64;
        frame.error_code = 0x10;
        frame.rip = 0xFFFF_FFFF_8000_1234;
        frame.cs = 0x08;
        frame.rsp = 0xFFFF_8000_0000_F000;
        frame.ss = 0x10;
        frame
    }

    #[test]
    fn layout_matches_push_order() {
        use core::mem::offset_of;
        // The stub pushes r15 last, so it must be the first field; the
        // hardware frame follows vector and error code.
        assert_eq!(offset_of!(TrapFrame, r15), 0);
        assert_eq!(offset_of!(TrapFrame, rax), 14 * 8);
        assert_eq!(offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(offset_of!(TrapFrame, error_code), 16 * 8);
        assert_eq!(offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(offset_of!(TrapFrame, ss), 21 * 8);
        assert_eq!(core::mem::size_of::<TrapFrame>(), 22 * 8);
    }

    #[test]
    fn dump_contains_all_registers() {
        let frame = sample_frame();
        let mut buf = [0u8; 512];
        let len = frame.format_into(&mut buf);
        let text = core::str::from_utf8(&buf[..len]).unwrap();

        for value in [
            "0000000000001111",
            "0000000000002222",
            "0000000000003333",
            "0000000000004444",
            "0000000000005555",
            "0000000000006666",
            "0000000000007777",
            "0000000000008888",
            "0000000000009999",
            "000000000000aaaa",
            "000000000000bbbb",
            "000000000000cccc",
            "000000000000dddd",
            "000000000000eeee",
            "000000000000ffff",
            "0000000000000202",
        ] {
            assert!(text.contains(value), "missing {value} in:\n{text}");
        }
        assert!(text.contains("General protection fault"));
        assert!(text.contains("RIP 0008:ffffffff80001234"));
    }

    #[test]
    fn dump_truncates_cleanly() {
        let frame = sample_frame();
        let mut buf = [0u8; 64];
        let len = frame.format_into(&mut buf);
        assert_eq!(len, 64);
    }

    #[test]
    fn user_mode_detection() {
        let mut frame = TrapFrame::zeroed();
        frame.cs = 0x08;
        assert!(!frame.from_user_mode());
        frame.cs = 0x23;
        assert!(frame.from_user_mode());
    }

    #[test]
    fn vector_names() {
        assert_eq!(exception_name(vector::PAGE_FAULT), Some("Page fault"));
        assert_eq!(exception_name(vector::NMI), Some("Non-maskable interrupt"));
        assert_eq!(exception_name(9), None);
        assert_eq!(exception_name(15), None);
        assert_eq!(exception_name(30), None);
    }
}

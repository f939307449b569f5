//! Assembly exception entry stubs.
//!
//! Each stub normalizes the stack to one shape: vectors where the CPU pushes
//! no error code get a synthetic zero, then the vector number goes on, then
//! the shared tail saves all fifteen general-purpose registers. That layout
//! is exactly [`TrapFrame`](quark_core::arch::x86_64::structures::trap_frame::TrapFrame),
//! which the tail passes to the dispatcher by pointer before unwinding and
//! returning with `iretq`.
//!
//! Stack alignment: the CPU aligns RSP to 16 before pushing the interrupt
//! frame, so after error code, vector, and 15 register pushes the `call`
//! leaves RSP ≡ 8 (mod 16) at the dispatcher's entry, as the SysV ABI
//! expects.

use quark_core::arch::x86_64::structures::trap_frame::vector;

use super::dispatch::trap_entry;

/// The shared save/dispatch/restore tail. Jumped to by every stub with the
/// error code and vector already on the stack.
#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Drop vector and error code.
        "add rsp, 16",
        "iretq",
        dispatch = sym trap_entry,
    );
}

macro_rules! exception_stub {
    // The CPU pushed no error code; push a synthetic zero first.
    ($name:ident, $vector:expr) => {
        /// Exception entry stub.
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
    // The CPU pushed a real error code.
    ($name:ident, $vector:expr, error_code) => {
        /// Exception entry stub (hardware error code).
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
}

exception_stub!(divide_error, vector::DIVIDE);
exception_stub!(debug, vector::DEBUG);
exception_stub!(nmi, vector::NMI);
exception_stub!(breakpoint, vector::BREAKPOINT);
exception_stub!(overflow, vector::OVERFLOW);
exception_stub!(bound_range, vector::BOUND_RANGE);
exception_stub!(invalid_opcode, vector::INVALID_OPCODE);
exception_stub!(device_not_available, vector::DEVICE_NOT_AVAILABLE);
exception_stub!(double_fault, vector::DOUBLE_FAULT, error_code);
exception_stub!(invalid_tss, vector::INVALID_TSS, error_code);
exception_stub!(segment_not_present, vector::SEGMENT_NOT_PRESENT, error_code);
exception_stub!(stack_segment_fault, vector::STACK_SEGMENT, error_code);
exception_stub!(general_protection, vector::GENERAL_PROTECTION, error_code);
exception_stub!(page_fault, vector::PAGE_FAULT, error_code);
exception_stub!(x87_floating_point, vector::X87_FLOATING_POINT);
exception_stub!(alignment_check, vector::ALIGNMENT_CHECK, error_code);
exception_stub!(machine_check, vector::MACHINE_CHECK);
exception_stub!(simd_floating_point, vector::SIMD_FLOATING_POINT);
exception_stub!(virtualization, vector::VIRTUALIZATION);

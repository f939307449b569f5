//! The exception dispatcher.
//!
//! Receives the [`TrapFrame`] built by the assembly stubs and routes it:
//! recoverable fault classes go to the task-exception facility, page faults
//! go straight into the VM manager, and everything else is terminal.

use core::sync::atomic::{AtomicPtr, Ordering};

use quark_core::arch::x86_64::registers::control::Cr2;
use quark_core::arch::x86_64::structures::trap_frame::{TrapFrame, exception_name, vector};

use crate::config::REGISTER_DUMP_BUFFER;
use crate::exceptions::{self, ExceptionKind};

/// Receives page faults: `(frame, fault_addr)`, where `fault_addr` is the
/// raw CR2 value (possibly non-canonical).
pub type PageFaultSink = fn(&mut TrapFrame, u64);

/// Where page faults go. Null until the VM manager registers itself; a page
/// fault before that is unrecoverable.
static PAGE_FAULT_SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the VM manager's fault entry. Tests may swap in probes.
pub fn set_page_fault_sink(sink: PageFaultSink) {
    PAGE_FAULT_SINK.store(sink as *mut (), Ordering::Release);
}

/// Entry point called by the assembly stubs.
///
/// Runs to completion on the vector's interrupt stack. Reads CR2 here, while
/// nothing else can have faulted in between, then hands off to the pure
/// routing logic.
pub extern "C" fn trap_entry(frame: &mut TrapFrame) {
    if frame.vector == u64::from(vector::PAGE_FAULT) {
        let fault_addr = Cr2::read();
        route_page_fault(frame, fault_addr);
    } else {
        route(frame);
    }
}

/// Routes every vector except page faults.
pub fn route(frame: &mut TrapFrame) {
    match frame.vector as u8 {
        // Arithmetic class.
        vector::DIVIDE => exceptions::dispatch(ExceptionKind::DivideByZero, frame),
        vector::OVERFLOW | vector::BOUND_RANGE => {
            exceptions::dispatch(ExceptionKind::Overflow, frame)
        }
        vector::X87_FLOATING_POINT => exceptions::dispatch(ExceptionKind::FloatingPoint, frame),
        vector::SIMD_FLOATING_POINT => exceptions::dispatch(ExceptionKind::Simd, frame),

        // Opcode class.
        vector::INVALID_OPCODE => exceptions::dispatch(ExceptionKind::InvalidOpcode, frame),
        vector::GENERAL_PROTECTION => {
            exceptions::dispatch(ExceptionKind::ProtectionFault, frame)
        }

        // Memory class (page faults never reach here).
        vector::ALIGNMENT_CHECK => exceptions::dispatch(ExceptionKind::AlignmentFault, frame),

        // Debug class.
        vector::DEBUG | vector::BREAKPOINT => {
            exceptions::dispatch(ExceptionKind::DebugBreakpoint, frame)
        }

        vector::NMI => panic!("Non-maskable interrupt"),

        vector::MACHINE_CHECK => {
            panic!("Machine check (error {:#018x})", frame.error_code)
        }

        // A fault during fault handling. Recovery would need its own
        // handling path; for now it is terminal.
        vector::DOUBLE_FAULT => {
            panic!("Double fault (error {:#x})\n{}", frame.error_code, dump(frame))
        }

        // The FPU trap will drive lazy FPU context switching; until the task
        // layer saves FPU state, any use is fatal in kernel mode and
        // unhandled in user mode.
        // TODO: enable the FPU for the running task once XSAVE state
        // switching exists.
        vector::DEVICE_NOT_AVAILABLE if !frame.from_user_mode() => {
            panic!("FPU access in kernel mode\n{}", dump(frame))
        }

        _ => {
            let name = exception_name(frame.vector as u8).unwrap_or("Unknown");
            panic!("Unhandled exception: {}\n{}", name, dump(frame));
        }
    }
}

/// Routes a page fault into the VM manager.
///
/// Not forwarded through the task-exception facility: the VM manager decides
/// whether the fault is demand backing, a task error, or fatal.
pub fn route_page_fault(frame: &mut TrapFrame, fault_addr: u64) {
    let sink = PAGE_FAULT_SINK.load(Ordering::Acquire);
    if sink.is_null() {
        panic!(
            "Page fault at {:#x} before the VM manager is ready\n{}",
            fault_addr,
            dump(frame)
        );
    }
    // SAFETY: Only valid `PageFaultSink` pointers are stored.
    let sink: PageFaultSink = unsafe { core::mem::transmute(sink) };
    sink(frame, fault_addr);
}

/// Formats the register dump into its fixed buffer and returns it as a
/// stack-owned string wrapper for panic messages.
fn dump(frame: &TrapFrame) -> DumpBuf {
    let mut buf = DumpBuf {
        buf: [0; REGISTER_DUMP_BUFFER],
        len: 0,
    };
    buf.len = frame.format_into(&mut buf.buf);
    buf
}

struct DumpBuf {
    buf: [u8; REGISTER_DUMP_BUFFER],
    len: usize,
}

impl core::fmt::Display for DumpBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<unprintable>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, AtomicUsize};

    // Probe state for the page-fault routing test. Only this test touches
    // the global sink.
    static SINK_CALLS: AtomicUsize = AtomicUsize::new(0);
    static SINK_ADDR: AtomicU64 = AtomicU64::new(0);
    static SINK_RBX: AtomicU64 = AtomicU64::new(0);

    fn probe_sink(frame: &mut TrapFrame, fault_addr: u64) {
        SINK_CALLS.fetch_add(1, Ordering::SeqCst);
        SINK_ADDR.store(fault_addr, Ordering::SeqCst);
        SINK_RBX.store(frame.rbx, Ordering::SeqCst);
    }

    #[test]
    fn page_fault_routed_to_vm_manager_once() {
        set_page_fault_sink(probe_sink);

        let mut frame = TrapFrame::zeroed();
        frame.vector = u64::from(vector::PAGE_FAULT);
        frame.error_code = 0b110; // user write to a non-present page
        frame.rbx = 0x1BADB002;
        let snapshot = frame;

        route_page_fault(&mut frame, 0xDEAD_BEEF_0000);

        assert_eq!(SINK_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(SINK_ADDR.load(Ordering::SeqCst), 0xDEAD_BEEF_0000);
        assert_eq!(SINK_RBX.load(Ordering::SeqCst), 0x1BADB002);
        // The dispatcher must not touch the register block.
        assert_eq!(frame, snapshot);
    }

    #[test]
    fn unhandled_reserved_vector_panics_with_dump() {
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = 30; // reserved vector
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
            frame.r15 = 0xF000;
            frame.rflags = 0x202;
            route(&mut frame);
        });

        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("Unhandled exception"), "{message}");
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
            "000000000000f000",
            "0000000000000202",
        ] {
            assert!(message.contains(value), "missing {value}: {message}");
        }
    }

    #[test]
    fn nmi_always_panics() {
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::NMI);
            route(&mut frame);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<&'static str>().expect("panic payload");
        assert!(message.contains("Non-maskable interrupt"));
    }

    #[test]
    fn machine_check_panics_with_error_code() {
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::MACHINE_CHECK);
            frame.error_code = 0xC0FE;
            route(&mut frame);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("Machine check"));
        assert!(message.contains("c0fe"), "{message}");
    }

    #[test]
    fn double_fault_is_terminal() {
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::DOUBLE_FAULT);
            route(&mut frame);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("Double fault"));
    }

    #[test]
    fn kernel_fpu_use_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::DEVICE_NOT_AVAILABLE);
            frame.cs = 0x08; // ring 0
            route(&mut frame);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("FPU access in kernel mode"));
    }

    #[test]
    fn user_fpu_use_reaches_unhandled_dump() {
        // Until lazy FPU switching exists, a user-mode #NM falls through to
        // the unhandled-exception dump.
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::DEVICE_NOT_AVAILABLE);
            frame.cs = 0x23; // ring 3
            route(&mut frame);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("Unhandled exception: Device unavailable (FPU)"));
    }

    #[test]
    fn arithmetic_class_reaches_task_facility() {
        // No handler registered: the facility escalates with its own
        // message, which proves the dispatcher picked the right class.
        let _guard = crate::exceptions::test_support::lock();
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::DIVIDE);
            route(&mut frame);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("divide-by-zero exception"), "{message}");
    }

    #[test]
    fn alignment_class_reaches_task_facility() {
        let _guard = crate::exceptions::test_support::lock();
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = u64::from(vector::ALIGNMENT_CHECK);
            route(&mut frame);
        });
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("alignment-fault exception"), "{message}");
    }
}

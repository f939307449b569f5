//! The task-exception facility.
//!
//! The trap dispatcher funnels recoverable fault classes here as
//! [`ExceptionKind`]s. A registered handler (the task layer, once it exists)
//! gets the first chance to consume the exception; if nothing claims it, the
//! fault escalates to a panic carrying the full register dump.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use quark_core::arch::x86_64::structures::trap_frame::TrapFrame;

use crate::config::REGISTER_DUMP_BUFFER;

/// Exception classes forwarded to tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Integer divide by zero.
    DivideByZero,
    /// Arithmetic overflow or bound-range violation.
    Overflow,
    /// x87 floating-point fault.
    FloatingPoint,
    /// SIMD floating-point fault.
    Simd,
    /// Invalid or undefined opcode.
    InvalidOpcode,
    /// General protection violation.
    ProtectionFault,
    /// Unaligned access with alignment checking enabled.
    AlignmentFault,
    /// Debug trap or breakpoint.
    DebugBreakpoint,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DivideByZero => "divide-by-zero",
            Self::Overflow => "overflow",
            Self::FloatingPoint => "floating-point",
            Self::Simd => "SIMD",
            Self::InvalidOpcode => "invalid-opcode",
            Self::ProtectionFault => "protection-fault",
            Self::AlignmentFault => "alignment-fault",
            Self::DebugBreakpoint => "debug-breakpoint",
        };
        f.write_str(name)
    }
}

/// A task-layer exception handler. Returns `true` if the exception was
/// consumed (forwarded to the faulting task); `false` lets it escalate.
pub type TaskExceptionHandler = fn(ExceptionKind, &mut TrapFrame) -> bool;

/// Registration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// A handler is already installed.
    AlreadyRegistered,
}

static HANDLER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the task-layer handler. Only one may be registered.
pub fn register_handler(handler: TaskExceptionHandler) -> Result<(), RegisterError> {
    HANDLER
        .compare_exchange(
            core::ptr::null_mut(),
            handler as *mut (),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|_| RegisterError::AlreadyRegistered)
}

/// Removes the registered handler.
pub fn unregister_handler() {
    HANDLER.store(core::ptr::null_mut(), Ordering::Release);
}

/// Routes an exception: to the registered handler when one exists and claims
/// it, otherwise to a panic with the register dump.
pub fn dispatch(kind: ExceptionKind, frame: &mut TrapFrame) {
    let ptr = HANDLER.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: Only valid `TaskExceptionHandler` pointers are stored.
        let handler: TaskExceptionHandler = unsafe { core::mem::transmute(ptr) };
        if handler(kind, frame) {
            return;
        }
    }

    let mut buf = [0u8; REGISTER_DUMP_BUFFER];
    let len = frame.format_into(&mut buf);
    let dump = core::str::from_utf8(&buf[..len]).unwrap_or("<register dump unprintable>");
    panic!("{kind} exception with no handler\n{dump}");
}


#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use quark_core::arch::x86_64::structures::trap_frame::vector;

    static CLAIMS: AtomicUsize = AtomicUsize::new(0);

    fn claiming_handler(kind: ExceptionKind, frame: &mut TrapFrame) -> bool {
        CLAIMS.fetch_add(1, Ordering::SeqCst);
        assert_eq!(kind, ExceptionKind::DivideByZero);
        assert_eq!(frame.vector, vector::DIVIDE as u64);
        true
    }

    fn declining_handler(_: ExceptionKind, _: &mut TrapFrame) -> bool {
        false
    }

    // The handler slot is process-global, so the whole lifecycle runs in one
    // test body to keep the harness's parallel tests off each other's state.
    #[test]
    fn handler_lifecycle() {
        let _guard = test_support::lock();

        // Claimed: the registered handler consumes the exception.
        register_handler(claiming_handler).unwrap();
        let mut frame = TrapFrame::zeroed();
        frame.vector = vector::DIVIDE as u64;
        dispatch(ExceptionKind::DivideByZero, &mut frame);
        assert_eq!(CLAIMS.load(Ordering::SeqCst), 1);

        // Only one handler at a time.
        assert_eq!(
            register_handler(claiming_handler),
            Err(RegisterError::AlreadyRegistered)
        );
        unregister_handler();

        // Declined: a handler returning false lets the fault escalate.
        register_handler(declining_handler).unwrap();
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.rax = 0xABCD;
            frame.vector = vector::GENERAL_PROTECTION as u64;
            dispatch(ExceptionKind::ProtectionFault, &mut frame);
        });
        unregister_handler();

        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().expect("panic payload");
        assert!(message.contains("protection-fault exception with no handler"));
        assert!(message.contains("000000000000abcd"), "dump missing RAX: {message}");

        // Unregistered: escalation also fires with no handler at all.
        let result = std::panic::catch_unwind(|| {
            let mut frame = TrapFrame::zeroed();
            frame.vector = vector::DIVIDE as u64;
            dispatch(ExceptionKind::DivideByZero, &mut frame);
        });
        assert!(result.is_err());
    }
}

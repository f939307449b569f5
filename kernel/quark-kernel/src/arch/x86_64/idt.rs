//! BSP IDT wiring.
//!
//! The first 32 gates carry the architectural exception stubs; each runs on
//! the interrupt stack its class is assigned to, so a fault taken while
//! handling another fault never lands on the stack already in use. Vectors 9
//! and 15 are reserved by the architecture and stay not-present, as does
//! everything from 32 up until device IRQ wiring exists.
//!
//! The table is per-processor by design (IRQ vectors above 31 will differ
//! between CPUs); AP bring-up instantiates more via [`build_idt`].

use quark_core::arch::x86_64::structures::gdt::KERNEL_CODE_SELECTOR;
use quark_core::arch::x86_64::structures::idt::{GateKind, Idt, IstStack};
use quark_core::arch::x86_64::structures::trap_frame::vector;
use quark_core::kdebug;
use quark_core::sync::LazyLock;

use super::interrupts::stubs;

/// One exception gate: vector, entry stub, gate flavor, and stack policy.
struct ExceptionGate {
    vector: u8,
    stub: unsafe extern "C" fn(),
    kind: GateKind,
    ist: IstStack,
}

/// The architectural exception wiring. NMI uses an interrupt gate so a
/// nested maskable interrupt cannot arrive on its stack; everything else is
/// a trap gate.
static EXCEPTION_GATES: &[ExceptionGate] = &[
    ExceptionGate {
        vector: vector::DIVIDE,
        stub: stubs::divide_error,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
    ExceptionGate {
        vector: vector::DEBUG,
        stub: stubs::debug,
        kind: GateKind::Trap,
        ist: IstStack::Debug,
    },
    ExceptionGate {
        vector: vector::NMI,
        stub: stubs::nmi,
        kind: GateKind::Interrupt,
        ist: IstStack::Nmi,
    },
    ExceptionGate {
        vector: vector::BREAKPOINT,
        stub: stubs::breakpoint,
        kind: GateKind::Trap,
        ist: IstStack::Debug,
    },
    ExceptionGate {
        vector: vector::OVERFLOW,
        stub: stubs::overflow,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
    ExceptionGate {
        vector: vector::BOUND_RANGE,
        stub: stubs::bound_range,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
    ExceptionGate {
        vector: vector::INVALID_OPCODE,
        stub: stubs::invalid_opcode,
        kind: GateKind::Trap,
        ist: IstStack::Faults,
    },
    ExceptionGate {
        vector: vector::DEVICE_NOT_AVAILABLE,
        stub: stubs::device_not_available,
        kind: GateKind::Trap,
        ist: IstStack::Faults,
    },
    ExceptionGate {
        vector: vector::DOUBLE_FAULT,
        stub: stubs::double_fault,
        kind: GateKind::Trap,
        ist: IstStack::Faults,
    },
    ExceptionGate {
        vector: vector::INVALID_TSS,
        stub: stubs::invalid_tss,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
    ExceptionGate {
        vector: vector::SEGMENT_NOT_PRESENT,
        stub: stubs::segment_not_present,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
    ExceptionGate {
        vector: vector::STACK_SEGMENT,
        stub: stubs::stack_segment_fault,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
    ExceptionGate {
        vector: vector::GENERAL_PROTECTION,
        stub: stubs::general_protection,
        kind: GateKind::Trap,
        ist: IstStack::Faults,
    },
    ExceptionGate {
        vector: vector::PAGE_FAULT,
        stub: stubs::page_fault,
        kind: GateKind::Trap,
        ist: IstStack::PageFault,
    },
    ExceptionGate {
        vector: vector::X87_FLOATING_POINT,
        stub: stubs::x87_floating_point,
        kind: GateKind::Trap,
        ist: IstStack::Faults,
    },
    ExceptionGate {
        vector: vector::ALIGNMENT_CHECK,
        stub: stubs::alignment_check,
        kind: GateKind::Trap,
        ist: IstStack::Faults,
    },
    ExceptionGate {
        vector: vector::MACHINE_CHECK,
        stub: stubs::machine_check,
        kind: GateKind::Trap,
        ist: IstStack::Debug,
    },
    ExceptionGate {
        vector: vector::SIMD_FLOATING_POINT,
        stub: stubs::simd_floating_point,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
    ExceptionGate {
        vector: vector::VIRTUALIZATION,
        stub: stubs::virtualization,
        kind: GateKind::Trap,
        ist: IstStack::Exceptions,
    },
];

/// Builds an IDT with the architectural exception gates wired.
pub fn build_idt() -> Idt {
    let mut idt = Idt::new();
    for gate in EXCEPTION_GATES {
        idt.set(
            gate.vector,
            gate.stub as u64,
            KERNEL_CODE_SELECTOR,
            gate.kind,
            gate.ist,
        );
    }
    idt
}

/// The BSP's table.
static BSP_IDT: LazyLock<Idt> = LazyLock::new(build_idt);

/// Loads the BSP IDT.
///
/// # Safety
///
/// The GDT must already be loaded (gates reference the kernel code
/// selector).
pub unsafe fn init() {
    let idt: &'static Idt = &BSP_IDT;
    // SAFETY: The static table is fully wired by its initializer.
    unsafe { idt.load() };
    kdebug!("IDT loaded, 32 exception vectors wired");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_gate_matches_policy() {
        let idt = build_idt();
        for gate in EXCEPTION_GATES {
            let entry = idt.entry(gate.vector);
            assert!(entry.is_present(), "vector {} missing", gate.vector);
            assert_eq!(
                entry.ist_index(),
                gate.ist as u8,
                "vector {} on wrong stack",
                gate.vector
            );
            assert_eq!(
                entry.is_trap_gate(),
                gate.kind == GateKind::Trap,
                "vector {} wrong gate kind",
                gate.vector
            );
            assert_eq!(entry.handler_addr(), gate.stub as u64);
            assert_eq!(entry.selector(), KERNEL_CODE_SELECTOR);
        }
    }

    #[test]
    fn ist_assignment_follows_the_policy_table() {
        let idt = build_idt();
        let expect = [
            (vector::DIVIDE, 1),
            (vector::OVERFLOW, 1),
            (vector::BOUND_RANGE, 1),
            (vector::INVALID_TSS, 1),
            (vector::SEGMENT_NOT_PRESENT, 1),
            (vector::STACK_SEGMENT, 1),
            (vector::SIMD_FLOATING_POINT, 1),
            (vector::VIRTUALIZATION, 1),
            (vector::INVALID_OPCODE, 2),
            (vector::DEVICE_NOT_AVAILABLE, 2),
            (vector::DOUBLE_FAULT, 2),
            (vector::GENERAL_PROTECTION, 2),
            (vector::X87_FLOATING_POINT, 2),
            (vector::ALIGNMENT_CHECK, 2),
            (vector::NMI, 3),
            (vector::DEBUG, 4),
            (vector::BREAKPOINT, 4),
            (vector::MACHINE_CHECK, 4),
            (vector::PAGE_FAULT, 7),
        ];
        for (vec, ist) in expect {
            assert_eq!(idt.entry(vec).ist_index(), ist, "vector {vec}");
        }
    }

    #[test]
    fn reserved_vectors_left_unwired() {
        let idt = build_idt();
        for vec in [9u8, 15, 21, 30, 31] {
            assert!(!idt.entry(vec).is_present(), "vector {vec} wired");
        }
        // Device IRQ range is untouched until drivers claim it.
        for vec in 32..=255u8 {
            assert!(!idt.entry(vec).is_present(), "vector {vec} wired");
        }
    }

    #[test]
    fn nmi_is_the_only_interrupt_gate() {
        let idt = build_idt();
        for gate in EXCEPTION_GATES {
            let is_interrupt = !idt.entry(gate.vector).is_trap_gate();
            assert_eq!(is_interrupt, gate.vector == vector::NMI);
        }
    }
}

//! CPU feature detection and enablement.
//!
//! The kernel refuses to run on processors missing its baseline feature set;
//! [`verify_required_features`] is the first thing the trap plane executes.
//! [`enable_features`] then turns on SYSCALL/SYSRET and, where supported,
//! the no-execute paging bit.

use core::arch::x86_64::__cpuid;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::registers::model_specific::{EferFlags, IA32_EFER};

/// A CPUID-probed feature requirement: the result registers of `leaf` must
/// contain every bit in the masks.
struct FeatureRequirement {
    leaf: u32,
    ecx: u32,
    edx: u32,
    name: &'static str,
}

/// Features the kernel unconditionally relies on. SSE 4.x puts the floor at
/// roughly Nehalem-era Intel or post-2015 AMD parts.
const REQUIRED_FEATURES: &[FeatureRequirement] = &[
    FeatureRequirement {
        leaf: 0x01,
        ecx: 0,
        edx: 1 << 9,
        name: "APIC",
    },
    FeatureRequirement {
        leaf: 0x01,
        ecx: 1 << 23,
        edx: 0,
        name: "POPCNT",
    },
    FeatureRequirement {
        leaf: 0x01,
        ecx: 1 << 13,
        edx: 0,
        name: "CMPXCHG16B",
    },
    FeatureRequirement {
        leaf: 0x01,
        ecx: (1 << 19) | (1 << 20),
        edx: 0,
        name: "SSE 4.1 and SSE 4.2",
    },
    FeatureRequirement {
        leaf: 0x01,
        ecx: 1 << 26,
        edx: 0,
        name: "XSAVE",
    },
];

/// Extended CPUID leaf carrying the NX bit.
const EXTENDED_FEATURE_LEAF: u32 = 0x8000_0001;

/// NX (execute disable) bit in EDX of leaf 0x8000_0001.
const NX_EDX_BIT: u32 = 1 << 20;

/// Whether EFER.NXE has been enabled on this machine.
static NX_ENABLED: AtomicBool = AtomicBool::new(false);

/// Returns the highest supported leaf in the same CPUID range as `leaf`.
fn max_leaf_for(leaf: u32) -> u32 {
    let range_base = leaf & 0x8000_0000;
    // SAFETY: CPUID is available on every x86_64 processor.
    unsafe { __cpuid(range_base) }.eax
}

/// Verifies that the processor supports every required feature.
///
/// # Panics
///
/// Panics naming the first missing feature. There is no fallback path; the
/// rest of the kernel assumes these features exist.
pub fn verify_required_features() {
    for feature in REQUIRED_FEATURES {
        assert!(
            feature.leaf <= max_leaf_for(feature.leaf),
            "cpuid leaf {:#010x} not supported",
            feature.leaf
        );

        // SAFETY: The leaf was just validated against the maximum.
        let result = unsafe { __cpuid(feature.leaf) };
        assert!(
            result.ecx & feature.ecx == feature.ecx && result.edx & feature.edx == feature.edx,
            "CPU does not support '{}' (ecx {:08x} edx {:08x}, masks ecx {:08x} edx {:08x})",
            feature.name,
            result.ecx,
            result.edx,
            feature.ecx,
            feature.edx,
        );
    }
}

/// Probes whether the processor implements the NX paging bit.
pub fn has_nx() -> bool {
    if EXTENDED_FEATURE_LEAF > max_leaf_for(EXTENDED_FEATURE_LEAF) {
        return false;
    }
    // SAFETY: The leaf was just validated against the maximum.
    unsafe { __cpuid(EXTENDED_FEATURE_LEAF) }.edx & NX_EDX_BIT != 0
}

/// Enables processor features the kernel relies on: the SYSCALL/SYSRET
/// extension, and NX when the processor has it.
///
/// # Safety
///
/// Must run at ring 0 on the processor being brought up, before any address
/// space relying on NX page protection is activated.
pub unsafe fn enable_features() {
    // SAFETY: IA32_EFER exists on all x86_64 processors; the caller
    // guarantees ring 0.
    unsafe {
        let mut efer = EferFlags::from_bits_truncate(IA32_EFER.read());
        efer |= EferFlags::SYSTEM_CALL_ENABLE;
        if has_nx() {
            efer |= EferFlags::NO_EXECUTE_ENABLE;
        }
        IA32_EFER.write(efer.bits());
    }

    if has_nx() {
        NX_ENABLED.store(true, Ordering::Release);
    }
}

/// Returns `true` once [`enable_features`] has switched on EFER.NXE.
///
/// The page-table engine consults this to decide whether page table entries
/// may carry the no-execute bit; on processors where the bit is
/// reserved-must-be-zero it is silently omitted.
pub fn nx_enabled() -> bool {
    NX_ENABLED.load(Ordering::Acquire)
}

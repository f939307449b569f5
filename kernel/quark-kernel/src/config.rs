//! Compile-time kernel configuration.

use quark_core::log::LogLevel;

/// Most verbose level the log sinks emit.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Debug;

/// Size of each per-CPU interrupt stack (IST1..IST7).
pub const IST_STACK_SIZE: usize = 4096;

/// Deepest call chain a backtrace will follow.
pub const BACKTRACE_MAX_FRAMES: usize = 50;

/// Size of the buffer the dispatcher formats register dumps into.
pub const REGISTER_DUMP_BUFFER: usize = 512;

/// Maximum memory-map entries accepted from the bootloader.
pub const MAX_BOOT_MEMORY_REGIONS: usize = 64;

/// Maximum kernel segments described by the boot stub.
pub const MAX_KERNEL_SEGMENTS: usize = 8;

/// Maximum VM entries registered in the kernel address space.
pub const MAX_KERNEL_VM_ENTRIES: usize = 64;

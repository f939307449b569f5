//! Architecture-specific kernel pieces. Only amd64 is implemented.

pub mod x86_64;

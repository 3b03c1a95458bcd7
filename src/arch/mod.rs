//! Architecture-specific code. x86-64 is the only supported target.

pub mod x86_64;

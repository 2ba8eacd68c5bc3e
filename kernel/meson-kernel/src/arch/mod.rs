//! Architecture support. Only x86_64 is implemented.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

//! Architecture-specific sample-source drivers

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

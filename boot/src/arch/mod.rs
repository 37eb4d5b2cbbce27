/// x86 (32-bit) architecture support.
pub mod x86;

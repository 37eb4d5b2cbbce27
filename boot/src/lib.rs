//! kestrel-boot - cold real-mode → 32-bit protected-mode bootstrap.
//!
//! Builds the CPU descriptor tables, negotiates with whatever already
//! owns the machine (a VCPI host, an XMS manager, bare DOS, or nothing
//! but the BIOS), performs reversible mode transitions, and pools every
//! discovered byte of physical memory for the kernel proper.
#![no_std]
#![allow(dead_code)]

#[cfg(any(test, feature = "mock-host"))]
extern crate alloc;

pub mod a20;
pub mod error;
pub mod host;
pub mod mem;
pub mod mode;
pub mod pic;
pub mod sequencer;
pub mod tables;
pub mod vcpi;

// Hardware-dependent modules - only compiled for the boot target, not
// host-target tests.
#[cfg(target_os = "none")]
pub mod arch;

pub use error::BootError;
pub use sequencer::{BootReport, Bootstrap, Handoff};

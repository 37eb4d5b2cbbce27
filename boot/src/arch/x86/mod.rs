/// x86 primitives: port I/O, flags, halt, the serial console, and the
/// real `HostBus` implementation with its transition trampolines.
pub mod bus;
pub mod serial;
pub mod trampoline;

/// Halt the CPU until the next interrupt.
#[inline(always)]
pub fn hlt() {
    unsafe {
        core::arch::asm!("hlt", options(nostack, nomem));
    }
}

/// Disable interrupts.
#[inline(always)]
pub fn cli() {
    unsafe {
        core::arch::asm!("cli", options(nostack, nomem));
    }
}

/// Enable interrupts.
#[inline(always)]
pub fn sti() {
    unsafe {
        core::arch::asm!("sti", options(nostack, nomem));
    }
}

/// Write a byte to an I/O port.
#[inline(always)]
pub fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nostack, preserves_flags),
        );
    }
}

/// Read a byte from an I/O port.
#[inline(always)]
pub fn inb(port: u16) -> u8 {
    let val: u8;
    unsafe {
        core::arch::asm!(
            "in al, dx",
            in("dx") port,
            out("al") val,
            options(nostack, preserves_flags),
        );
    }
    val
}

/// Read EFLAGS.
#[inline(always)]
pub fn eflags() -> u32 {
    let flags: u32;
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {}",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

/// Write EFLAGS.
#[inline(always)]
pub fn set_eflags(flags: u32) {
    unsafe {
        core::arch::asm!(
            "push {}",
            "popfd",
            in(reg) flags,
            options(nomem),
        );
    }
}

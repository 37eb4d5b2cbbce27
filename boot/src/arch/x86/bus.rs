/// `HostBus` on the real machine: port I/O and control-register work via
/// inline assembly, transitions via the trampolines, memory through the
/// identity mapping.
use crate::host::{CpuMode, HostBus, RealPtr, RegisterBlock, SwitchDirection, SwitchFrame};

use super::trampoline;

pub struct PcBus {
    mode: CpuMode,
}

impl PcBus {
    pub const fn new() -> Self {
        Self {
            mode: CpuMode::Real,
        }
    }
}

impl HostBus for PcBus {
    fn outb(&mut self, port: u16, val: u8) {
        super::outb(port, val);
    }

    fn inb(&mut self, port: u16) -> u8 {
        super::inb(port)
    }

    fn cli(&mut self) {
        super::cli();
    }

    fn eflags(&self) -> u32 {
        super::eflags()
    }

    fn set_eflags(&mut self, flags: u32) {
        super::set_eflags(flags);
    }

    fn read_u8(&self, linear: u32) -> u8 {
        unsafe { core::ptr::read_volatile(linear as *const u8) }
    }

    fn write_u8(&mut self, linear: u32, val: u8) {
        unsafe { core::ptr::write_volatile(linear as *mut u8, val) }
    }

    fn read_u32(&self, linear: u32) -> u32 {
        unsafe { core::ptr::read_volatile(linear as *const u32) }
    }

    fn write_u32(&mut self, linear: u32, val: u32) {
        unsafe { core::ptr::write_volatile(linear as *mut u32, val) }
    }

    /// Wraparound probe: with the gate closed, 0x100500 aliases 0x500.
    fn a20_enabled(&self) -> bool {
        const LOW: u32 = 0x500;
        const HIGH: u32 = 0x10_0500;
        unsafe {
            let low = LOW as *mut u8;
            let high = HIGH as *mut u8;
            let saved_low = core::ptr::read_volatile(low);
            let saved_high = core::ptr::read_volatile(high);
            core::ptr::write_volatile(low, 0x5A);
            core::ptr::write_volatile(high, 0xA5);
            let distinct = core::ptr::read_volatile(low) != core::ptr::read_volatile(high);
            core::ptr::write_volatile(low, saved_low);
            core::ptr::write_volatile(high, saved_high);
            distinct
        }
    }

    fn real_int(&mut self, vector: u8, regs: &mut RegisterBlock) {
        debug_assert_eq!(self.mode, CpuMode::Real);
        trampoline::real_int(vector, regs);
    }

    fn real_far_call(&mut self, entry: RealPtr, regs: &mut RegisterBlock) {
        debug_assert_eq!(self.mode, CpuMode::Real);
        trampoline::real_far_call(entry, regs);
    }

    fn raw_enter_pmode(&mut self, frame: &SwitchFrame) {
        unsafe { trampoline::boot_raw_enter_pmode(frame) };
        self.mode = CpuMode::Pmode;
    }

    fn raw_leave_pmode(&mut self, frame: &SwitchFrame) {
        unsafe { trampoline::boot_raw_leave_pmode(frame) };
        self.mode = CpuMode::Real;
    }

    fn vcpi_switch(&mut self, switch_data: u32, dir: SwitchDirection) {
        let dir_word = match dir {
            SwitchDirection::ToPmode => 0,
            SwitchDirection::ToReal => 1,
        };
        unsafe { trampoline::boot_vcpi_switch(switch_data, dir_word) };
        self.mode = match dir {
            SwitchDirection::ToPmode => CpuMode::Pmode,
            SwitchDirection::ToReal => CpuMode::Real,
        };
    }

    fn clts(&mut self) {
        unsafe { core::arch::asm!("clts", options(nostack, nomem)) };
    }

    fn load_real_idt(&mut self) {
        unsafe { trampoline::boot_load_real_idt() };
    }

    fn mode(&self) -> CpuMode {
        self.mode
    }
}

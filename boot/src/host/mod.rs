/// Machine access seam.
///
/// Every bootstrap state machine (mode switching, VCPI negotiation, PIC
/// remap, A20, memory probing) is written against `HostBus` instead of
/// touching ports, real-mode services, or control registers directly.
/// `PcBus` (arch/x86) implements it with inline assembly on the real
/// machine; `MockHost` implements it as a simulated PC for host-target
/// unit tests.
#[cfg(any(test, feature = "mock-host"))]
pub mod mock;

#[cfg(any(test, feature = "mock-host"))]
pub use mock::MockHost;

/// CPU operating mode as the bootstrap tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Pmode,
}

/// Direction of a VCPI-mediated switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDirection {
    ToPmode,
    ToReal,
}

// EFLAGS bits the bootstrap cares about.
pub const FLAG_CARRY: u32 = 1 << 0;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;

/// Real-mode far pointer (segment:offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RealPtr {
    pub segment: u16,
    pub offset: u16,
}

impl RealPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Linear address of this far pointer.
    pub const fn linear(self) -> u32 {
        ((self.segment as u32) << 4) + self.offset as u32
    }
}

/// Register image passed to real-mode interrupt and far-call services.
///
/// Segment registers not listed (CS, SS) are supplied by the trampoline.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RegisterBlock {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub ds: u16,
    pub es: u16,
    pub flags: u16,
}

impl RegisterBlock {
    /// Carry flag after the call - the common BIOS/DOS failure signal.
    pub fn carry(&self) -> bool {
        self.flags as u32 & FLAG_CARRY != 0
    }

    pub fn ah(&self) -> u8 {
        (self.eax >> 8) as u8
    }

    pub fn al(&self) -> u8 {
        self.eax as u8
    }

    pub fn set_ax(&mut self, ax: u16) {
        self.eax = (self.eax & 0xFFFF_0000) | ax as u32;
    }
}

/// Selector and table-pointer set used by the transition trampolines.
///
/// Carried by value so the trampoline can reach it from both modes; the
/// table base addresses are *linear*, matching how LGDT/LIDT interpret
/// them.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SwitchFrame {
    pub gdt_limit: u16,
    pub gdt_base: u32,
    pub idt_limit: u16,
    pub idt_base: u32,
    pub code_sel: u16,
    pub data_sel: u16,
    pub code16_sel: u16,
    pub data16_sel: u16,
    pub tss_sel: u16,
    pub ldt_sel: u16,
}

/// Narrow machine-access trait. See module docs.
pub trait HostBus {
    // ---- Port I/O ----
    fn outb(&mut self, port: u16, val: u8);
    fn inb(&mut self, port: u16) -> u8;

    // ---- Flags / interrupt gate ----
    fn cli(&mut self);
    fn eflags(&self) -> u32;
    fn set_eflags(&mut self, flags: u32);

    // ---- Linear memory (real-mode window + identity-mapped ranges) ----
    fn read_u8(&self, linear: u32) -> u8;
    fn write_u8(&mut self, linear: u32, val: u8);
    fn read_u32(&self, linear: u32) -> u32;
    fn write_u32(&mut self, linear: u32, val: u32);

    // ---- A20 gate observation (manipulation goes through ports/XMS) ----
    fn a20_enabled(&self) -> bool;

    // ---- Real-mode services; caller must be in real mode ----
    fn real_int(&mut self, vector: u8, regs: &mut RegisterBlock);
    fn real_far_call(&mut self, entry: RealPtr, regs: &mut RegisterBlock);

    // ---- Transition primitives, used only by the mode-switch layer ----
    fn raw_enter_pmode(&mut self, frame: &SwitchFrame);
    fn raw_leave_pmode(&mut self, frame: &SwitchFrame);
    /// VCPI-mediated switch. `switch_data` is the linear address of the
    /// client switch-data block (vcpi/session.rs); the entry EIP/CS words
    /// are patched by the trampoline immediately before the host call.
    fn vcpi_switch(&mut self, switch_data: u32, dir: SwitchDirection);

    /// Clear the FPU task-switched flag (CLTS) so no spurious #NM fires
    /// across a transition.
    fn clts(&mut self);
    /// Reload the canonical real-mode IDT (limit 0xFFFF, base 0).
    fn load_real_idt(&mut self);

    fn mode(&self) -> CpuMode;
}

/// Read `buf.len()` bytes starting at `linear`.
pub fn read_bytes(bus: &dyn HostBus, linear: u32, buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = bus.read_u8(linear + i as u32);
    }
}

/// Write `buf` starting at `linear`.
pub fn write_bytes(bus: &mut dyn HostBus, linear: u32, buf: &[u8]) {
    for (i, b) in buf.iter().enumerate() {
        bus.write_u8(linear + i as u32, *b);
    }
}

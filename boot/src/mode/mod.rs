/// Reversible real-mode ↔ protected-mode transitions.
///
/// Exactly one backend is active at a time: `Raw` drives the processor
/// directly (`mov cr0` plus segment reloads), `Vcpi` delegates to the
/// host's documented entry points and carries the session negotiated by
/// vcpi/. The backend is selected once at boot and may be upgraded
/// Raw→Vcpi exactly once; it is never removed afterwards.
///
/// Transitions are synchronous, non-reentrant, and run entirely with
/// interrupts disabled. Requesting a transition into the current mode is
/// a programming error and is not defended against.
pub mod bridge;

#[cfg(test)]
mod tests;

use crate::a20::{self, A20Method};
use crate::host::{CpuMode, HostBus, SwitchDirection, SwitchFrame, FLAG_DF};
use crate::error::BootError;
use crate::vcpi::VcpiSession;

/// The active transition backend.
pub enum Backend {
    /// Direct in-processor switch; no host cooperation. Bare metal and
    /// plain DOS without a memory manager.
    Raw,
    /// Host-mediated switch through the VCPI entry points. The host owns
    /// paging, so page translation differs between the two modes and the
    /// switch runs with the session's bootstrap page tables.
    Vcpi(VcpiSession),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Raw => BackendKind::Raw,
            Backend::Vcpi(_) => BackendKind::Vcpi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Raw,
    Vcpi,
}

pub struct ModeSwitch {
    mode: CpuMode,
    backend: Backend,
    a20_method: A20Method,
    frame: SwitchFrame,
    saved_eflags: u32,
    saved_a20: bool,
}

impl ModeSwitch {
    pub fn new(frame: SwitchFrame, a20_method: A20Method) -> Self {
        Self {
            mode: CpuMode::Real,
            backend: Backend::Raw,
            a20_method,
            frame,
            saved_eflags: 0,
            saved_a20: false,
        }
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    /// Replace the frame (e.g. after the tables moved) so the next
    /// transition uses the current linear addresses.
    pub fn set_frame(&mut self, frame: SwitchFrame) {
        self.frame = frame;
    }

    /// One-shot Raw→Vcpi upgrade, done by the VCPI negotiator after the
    /// session is fully prepared.
    pub fn upgrade_to_vcpi(&mut self, session: VcpiSession) {
        debug_assert!(matches!(self.backend, Backend::Raw));
        self.backend = Backend::Vcpi(session);
    }

    /// Enter protected mode.
    pub fn to_pmode(&mut self, bus: &mut dyn HostBus) -> Result<(), BootError> {
        debug_assert_eq!(self.mode, CpuMode::Real);

        // Snapshot caller state, then close the interrupt window for the
        // whole transition.
        self.saved_eflags = bus.eflags();
        bus.cli();
        self.saved_a20 = bus.a20_enabled();

        a20::enable(bus, self.a20_method)?;

        // The backend entry sequence loads a temporary GDT valid at the
        // current physical location first - the final GDT's linear
        // address may be unreachable before paging - then jumps through
        // the final selectors.
        match &self.backend {
            Backend::Raw => bus.raw_enter_pmode(&self.frame),
            Backend::Vcpi(session) => {
                bus.vcpi_switch(session.switch_data_linear(), SwitchDirection::ToPmode)
            }
        }

        // Reload segment state is part of the trampoline; normalize the
        // direction flag here so string ops behave no matter what the
        // host left behind.
        bus.set_eflags(bus.eflags() & !FLAG_DF);
        self.mode = CpuMode::Pmode;
        Ok(())
    }

    /// Return to real mode - the mirror of `to_pmode`.
    pub fn to_real(&mut self, bus: &mut dyn HostBus) -> Result<(), BootError> {
        debug_assert_eq!(self.mode, CpuMode::Pmode);

        bus.cli();
        // A task switch may have left TS set; a pending #NM across the
        // transition would vector through a half-valid IDT.
        bus.clts();

        // No per-switch PIC work: when the VCPI path relocated the
        // vector window it also mirrored the real-mode vectors at the
        // new base, so the window is valid in both modes (vcpi/irq.rs).
        match &self.backend {
            Backend::Raw => bus.raw_leave_pmode(&self.frame),
            Backend::Vcpi(session) => {
                bus.vcpi_switch(session.switch_data_linear(), SwitchDirection::ToReal)
            }
        }

        // 16-bit compatible segments are live again; put the canonical
        // real-mode IDT back before anything can vector.
        bus.load_real_idt();

        a20::restore(bus, self.a20_method, self.saved_a20)?;
        bus.set_eflags(self.saved_eflags);
        self.mode = CpuMode::Real;
        Ok(())
    }
}

/// VCPI (Virtual Control Program Interface) host negotiation.
///
/// When an EMM-managed host (EMM386 and friends) already runs the
/// machine in V86 mode, a raw `mov cr0` switch is impossible - protected
/// mode must be shared through the host's documented entry points. This
/// module detects such a host, negotiates page tables, the protected-mode
/// entry, and the hardware-IRQ vector window, and supplies the `Vcpi`
/// transition backend.
pub mod irq;
pub mod negotiator;
pub mod session;

#[cfg(test)]
mod tests;

pub use irq::IrqVectorWindow;
pub use negotiator::{VcpiNegotiator, VcpiState};
pub use session::VcpiSession;

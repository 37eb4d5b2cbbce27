/// Real-mode call bridge.
///
/// Lets protected-mode code invoke a BIOS/DOS interrupt without knowing
/// which transition backend is active: round-trip through real mode,
/// issue the interrupt, come back. Callers already in real mode get the
/// interrupt directly.
use super::ModeSwitch;
use crate::error::BootError;
use crate::host::{CpuMode, HostBus, RegisterBlock};

pub fn real_int(
    switch: &mut ModeSwitch,
    bus: &mut dyn HostBus,
    vector: u8,
    regs: &mut RegisterBlock,
) -> Result<(), BootError> {
    match switch.mode() {
        CpuMode::Real => {
            bus.real_int(vector, regs);
            Ok(())
        }
        CpuMode::Pmode => {
            switch.to_real(bus)?;
            bus.real_int(vector, regs);
            switch.to_pmode(bus)
        }
    }
}

/// A20 address-line gate control.
///
/// The 21st address bit is gated off after reset for 8086 wraparound
/// compatibility and must be enabled before anything above 1 MiB is
/// touched. Which enable path works is host-specific: the keyboard
/// controller is the classic route, port 0x92 ("fast A20") the common
/// chipset shortcut, and an XMS manager owns the gate outright when one
/// is resident.
use crate::error::{BootError, HANDSHAKE_POLL_LIMIT};
use crate::host::{HostBus, RealPtr, RegisterBlock};

const KBC_STATUS: u16 = 0x64;
const KBC_CMD: u16 = 0x64;
const KBC_DATA: u16 = 0x60;

const KBC_CMD_WRITE_OUTPUT: u8 = 0xD1;
const KBC_OUTPUT_A20_ON: u8 = 0xDF;
const KBC_OUTPUT_A20_OFF: u8 = 0xDD;

const FAST_A20_PORT: u16 = 0x92;

/// How this host's A20 gate is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A20Method {
    /// Keyboard-controller output port (command 0xD1).
    Keyboard,
    /// System control port A, bit 1.
    FastGate,
    /// XMS local enable/disable through the manager's entry point.
    Xms(RealPtr),
}

/// Enable the gate via `method`, verifying the line actually responds.
pub fn enable(bus: &mut dyn HostBus, method: A20Method) -> Result<(), BootError> {
    set(bus, method, true)
}

/// Restore the gate to a previously observed state.
pub fn restore(bus: &mut dyn HostBus, method: A20Method, enabled: bool) -> Result<(), BootError> {
    if bus.a20_enabled() == enabled {
        return Ok(());
    }
    set(bus, method, enabled)
}

fn set(bus: &mut dyn HostBus, method: A20Method, on: bool) -> Result<(), BootError> {
    match method {
        A20Method::Keyboard => {
            wait_input_clear(bus)?;
            bus.outb(KBC_CMD, KBC_CMD_WRITE_OUTPUT);
            wait_input_clear(bus)?;
            bus.outb(
                KBC_DATA,
                if on { KBC_OUTPUT_A20_ON } else { KBC_OUTPUT_A20_OFF },
            );
            wait_input_clear(bus)?;
        }
        A20Method::FastGate => {
            // Bit 0 is system reset; never write it back set.
            let mut val = bus.inb(FAST_A20_PORT) & !0x01;
            if on {
                val |= 0x02;
            } else {
                val &= !0x02;
            }
            bus.outb(FAST_A20_PORT, val);
        }
        A20Method::Xms(entry) => {
            let mut regs = RegisterBlock::default();
            // AH=05 local enable / AH=06 local disable.
            regs.set_ax(if on { 0x0500 } else { 0x0600 });
            bus.real_far_call(entry, &mut regs);
            if regs.eax & 0xFFFF != 1 {
                return Err(BootError::ProtocolViolation("XMS A20 request refused"));
            }
        }
    }

    if bus.a20_enabled() != on {
        return Err(BootError::ProtocolViolation("A20 line did not respond"));
    }
    Ok(())
}

/// Poll the controller's input-buffer-full bit, bounded by
/// `HANDSHAKE_POLL_LIMIT`.
fn wait_input_clear(bus: &mut dyn HostBus) -> Result<(), BootError> {
    for _ in 0..HANDSHAKE_POLL_LIMIT {
        if bus.inb(KBC_STATUS) & 0x02 == 0 {
            return Ok(());
        }
    }
    Err(BootError::Timeout("keyboard controller input buffer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;

    #[test]
    fn fast_gate_toggles_without_touching_reset() {
        let mut host = MockHost::new();
        enable(&mut host, A20Method::FastGate).unwrap();
        assert!(host.a20_enabled());
        set(&mut host, A20Method::FastGate, false).unwrap();
        assert!(!host.a20_enabled());
        assert!(!host.reset_pulsed);
    }

    #[test]
    fn keyboard_controller_handshake() {
        let mut host = MockHost::new();
        host.kbc_busy_polls = 3; // a few busy polls before it settles
        enable(&mut host, A20Method::Keyboard).unwrap();
        assert!(host.a20_enabled());
    }

    #[test]
    fn wedged_controller_reports_timeout() {
        let mut host = MockHost::new();
        host.kbc_busy_polls = u32::MAX;
        assert!(matches!(
            enable(&mut host, A20Method::Keyboard),
            Err(BootError::Timeout(_))
        ));
    }

    #[test]
    fn restore_skips_matching_state() {
        let mut host = MockHost::new();
        host.set_a20(true);
        restore(&mut host, A20Method::FastGate, true).unwrap();
        assert!(host.events().is_empty());
    }
}

/// Hardware-IRQ vector window negotiation.
///
/// Some VCPI hosts report the BIOS-default master base 0x08, which sits
/// on top of the CPU exception vectors. When that happens the bootstrap
/// picks a free real-mode vector window, mirrors the current hardware
/// vectors there, reprograms the master PIC, and tells the host - all
/// under `cli`, so no interrupt is lost or misrouted mid-move.
use crate::error::BootError;
use crate::host::{HostBus, RegisterBlock};
use crate::pic;

use super::session::{VcpiSession, VCPI_GET_IRQ_WINDOW, VCPI_SET_IRQ_WINDOW};

/// Negotiated master/slave PIC vector bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqVectorWindow {
    pub master_base: u8,
    pub slave_base: u8,
}

/// Lowest vector base we will relocate to - below this the window would
/// collide with the CPU exceptions itself.
const MIN_RELOCATED_BASE: u8 = 0x20;

/// Query the host's vector window and relocate the master PIC if the
/// host insists on the exception-colliding default. Runs in real mode,
/// before the first switch.
pub fn negotiate(bus: &mut dyn HostBus, session: &mut VcpiSession) -> Result<(), BootError> {
    let mut regs = RegisterBlock::default();
    regs.set_ax(VCPI_GET_IRQ_WINDOW);
    bus.real_int(0x67, &mut regs);
    if regs.ah() != 0 {
        return Err(BootError::ProtocolViolation("VCPI IRQ window query failed"));
    }

    let window = IrqVectorWindow {
        master_base: regs.ebx as u8,
        slave_base: regs.ecx as u8,
    };
    if window.master_base > 0xF8 || window.slave_base > 0xF8 {
        return Err(BootError::ProtocolViolation("VCPI IRQ window out of range"));
    }
    session.irq_window = window;

    if window.master_base != pic::BIOS_MASTER_BASE {
        return Ok(());
    }

    let new_base = find_free_vector_run(bus).ok_or(BootError::ResourceExhausted(
        "no free interrupt vector window",
    ))?;

    // Save → mirror → reprogram → inform, atomically w.r.t. interrupts.
    let saved_flags = bus.eflags();
    bus.cli();

    for i in 0..8u32 {
        session.saved_irq_vectors[i as usize] = bus.read_u32((new_base as u32 + i) * 4);
    }
    for i in 0..8u32 {
        let current = bus.read_u32((pic::BIOS_MASTER_BASE as u32 + i) * 4);
        bus.write_u32((new_base as u32 + i) * 4, current);
    }

    pic::remap(bus, new_base, window.slave_base);

    let mut regs = RegisterBlock::default();
    regs.set_ax(VCPI_SET_IRQ_WINDOW);
    regs.ebx = new_base as u32;
    regs.ecx = window.slave_base as u32;
    bus.real_int(0x67, &mut regs);
    let informed = regs.ah() == 0;

    bus.set_eflags(saved_flags);

    if !informed {
        return Err(BootError::ProtocolViolation(
            "host rejected relocated IRQ window",
        ));
    }

    session.irq_window.master_base = new_base;
    session.relocated_base = new_base;
    session.pic_relocated = true;
    Ok(())
}

/// Scan the real-mode vector table downward from 0xFF for a run of 8
/// consecutive identical entries - the traditional heuristic for "these
/// vectors are unused" (BIOSes park unused vectors on one IRET stub).
/// Candidates are 8-aligned because ICW2 ignores the low three bits.
pub fn find_free_vector_run(bus: &dyn HostBus) -> Option<u8> {
    let mut base = 0xF8u8;
    while base >= MIN_RELOCATED_BASE {
        let first = bus.read_u32(base as u32 * 4);
        let mut identical = true;
        for i in 1..8u32 {
            if bus.read_u32((base as u32 + i) * 4) != first {
                identical = false;
                break;
            }
        }
        if identical {
            return Some(base);
        }
        base -= 8;
    }
    None
}

/// Shutdown step: PIC back to the BIOS master base. Caller holds `cli`
/// and informs the host between this and `restore_vectors`.
pub fn restore_pic(bus: &mut dyn HostBus, session: &VcpiSession) {
    pic::remap(bus, pic::BIOS_MASTER_BASE, session.irq_window.slave_base);
}

/// Shutdown step: put the 8 saved real-mode vectors back bit-for-bit.
pub fn restore_vectors(bus: &mut dyn HostBus, session: &VcpiSession) {
    for i in 0..8u32 {
        bus.write_u32(
            (session.relocated_base as u32 + i) * 4,
            session.saved_irq_vectors[i as usize],
        );
    }
}

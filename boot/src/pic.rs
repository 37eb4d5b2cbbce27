/// 8259 PIC (Programmable Interrupt Controller) programming.
///
/// The BIOS maps IRQ 0-7 to vectors 8-15, on top of the CPU exceptions.
/// The bootstrap remaps the controllers to whatever vector window was
/// negotiated (vcpi/irq.rs) or to the kernel's final window, preserving
/// the interrupt masks across the reprogramming. Callers hold interrupts
/// disabled around the whole sequence.
use crate::host::HostBus;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x11; // initialization + ICW4 needed
const ICW4_8086: u8 = 0x01; // 8086 mode

/// BIOS-default master base (the CPU-exception-colliding one).
pub const BIOS_MASTER_BASE: u8 = 0x08;
/// BIOS-default slave base.
pub const BIOS_SLAVE_BASE: u8 = 0x70;

/// Reprogram both controllers to new vector bases, preserving masks.
/// Bases must be multiples of 8 (ICW2 ignores the low three bits).
pub fn remap(bus: &mut dyn HostBus, master_base: u8, slave_base: u8) {
    let mask1 = bus.inb(PIC1_DATA);
    let mask2 = bus.inb(PIC2_DATA);

    // ICW1: start the initialization sequence on both controllers.
    bus.outb(PIC1_CMD, ICW1_INIT);
    io_wait(bus);
    bus.outb(PIC2_CMD, ICW1_INIT);
    io_wait(bus);

    // ICW2: vector bases.
    bus.outb(PIC1_DATA, master_base & !0x7);
    io_wait(bus);
    bus.outb(PIC2_DATA, slave_base & !0x7);
    io_wait(bus);

    // ICW3: slave on IRQ2 / cascade identity.
    bus.outb(PIC1_DATA, 4);
    io_wait(bus);
    bus.outb(PIC2_DATA, 2);
    io_wait(bus);

    // ICW4: 8086 mode.
    bus.outb(PIC1_DATA, ICW4_8086);
    io_wait(bus);
    bus.outb(PIC2_DATA, ICW4_8086);
    io_wait(bus);

    // Restore the masks exactly as the host had them.
    bus.outb(PIC1_DATA, mask1);
    bus.outb(PIC2_DATA, mask2);
}

/// Current interrupt masks (master, slave).
pub fn masks(bus: &mut dyn HostBus) -> (u8, u8) {
    (bus.inb(PIC1_DATA), bus.inb(PIC2_DATA))
}

/// Small delay between ICW writes; old controllers need settle time.
fn io_wait(bus: &mut dyn HostBus) {
    bus.outb(0x80, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;

    #[test]
    fn remap_moves_bases_and_preserves_masks() {
        let mut host = MockHost::new();
        host.set_pic_masks(0xAB, 0xCD);
        remap(&mut host, 0xF8, 0x70);
        assert_eq!(host.pic_bases(), (0xF8, 0x70));
        assert_eq!(masks(&mut host), (0xAB, 0xCD));
    }

    #[test]
    fn base_low_bits_are_dropped() {
        let mut host = MockHost::new();
        remap(&mut host, 0x23, 0x2B);
        assert_eq!(host.pic_bases(), (0x20, 0x28));
    }
}

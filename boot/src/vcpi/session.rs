/// VCPI session state: bootstrap page tables, host entry point, switch
/// data, and everything shutdown has to undo.
use crate::error::BootError;
use crate::host::{write_bytes, HostBus, RealPtr};
use crate::mem::range::{ONE_MB, PAGE_SIZE};
use crate::tables::Descriptor;

use super::irq::IrqVectorWindow;

// Wire-level VCPI function numbers (int 0x67). Compatibility-critical;
// do not change.
pub const VCPI_DETECT: u16 = 0xDE00;
pub const VCPI_GET_INTERFACE: u16 = 0xDE01;
pub const VCPI_MAX_PHYS_ADDR: u16 = 0xDE02;
pub const VCPI_FREE_PAGE_COUNT: u16 = 0xDE03;
pub const VCPI_ALLOC_PAGE: u16 = 0xDE04;
pub const VCPI_GET_IRQ_WINDOW: u16 = 0xDE0A;
pub const VCPI_SET_IRQ_WINDOW: u16 = 0xDE0B;
pub const VCPI_SWITCH_TO_PMODE: u16 = 0xDE0C;

// Page-table entry bits.
pub const PTE_PRESENT: u32 = 1 << 0;
pub const PTE_WRITE: u32 = 1 << 1;
pub const PTE_USER: u32 = 1 << 2;

/// First page of the ROM/video window: identity-mapped but allowed to be
/// read-only.
pub const ROM_WINDOW_START: u32 = 0xA0000;

/// Scratch block carved from low DOS memory alongside the two bootstrap
/// page-table pages. Holds the data the host must be able to address
/// from both modes: the 3-descriptor exchange buffer, the switch-data
/// block, and the GDTR/IDTR pseudo-descriptors.
pub const SCRATCH_DESCRIPTORS: u32 = 0; // 3 × 8 bytes
pub const SCRATCH_SWITCH_DATA: u32 = 24; // 22 bytes + pad
pub const SCRATCH_GDTR: u32 = 48; // 6 bytes
pub const SCRATCH_IDTR: u32 = 56; // 6 bytes
pub const SCRATCH_BYTES: u32 = 64;

/// The client switch-data block handed to the host on every mediated
/// transition (VCPI spec, "switch to protected mode"): CR3, pointers to
/// the GDTR/IDTR images, LDTR and TR selectors, and the protected-mode
/// resume point. 22 bytes on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchData {
    pub cr3: u32,
    pub gdtr_linear: u32,
    pub idtr_linear: u32,
    pub ldt_sel: u16,
    pub tss_sel: u16,
    pub eip: u32,
    pub cs: u16,
}

impl SwitchData {
    pub const WIRE_BYTES: usize = 22;

    /// Serialize to the wire layout.
    pub fn to_bytes(&self) -> [u8; Self::WIRE_BYTES] {
        let mut out = [0u8; Self::WIRE_BYTES];
        out[0..4].copy_from_slice(&self.cr3.to_le_bytes());
        out[4..8].copy_from_slice(&self.gdtr_linear.to_le_bytes());
        out[8..12].copy_from_slice(&self.idtr_linear.to_le_bytes());
        out[12..14].copy_from_slice(&self.ldt_sel.to_le_bytes());
        out[14..16].copy_from_slice(&self.tss_sel.to_le_bytes());
        out[16..20].copy_from_slice(&self.eip.to_le_bytes());
        out[20..22].copy_from_slice(&self.cs.to_le_bytes());
        out
    }
}

/// Everything a live VCPI negotiation owns. Torn down (rolled back) only
/// by explicit shutdown, PIC and vectors first.
pub struct VcpiSession {
    pub version: (u8, u8),
    /// Physical address of the bootstrap page directory (low DOS page).
    pub page_dir: u32,
    /// Physical address of bootstrap page table 0 (low DOS page).
    pub page_table0: u32,
    /// Scratch block base (low DOS memory).
    pub scratch: u32,
    /// Host protected-mode entry: offset into the host's code segment.
    pub pmode_entry: u32,
    /// First page-table index the host did not fill.
    pub first_free_pte: u32,
    pub irq_window: IrqVectorWindow,
    /// The 8 real-mode vectors overwritten during relocation, saved
    /// bit-for-bit for shutdown.
    pub saved_irq_vectors: [u32; 8],
    /// Vector base where the hardware vectors were mirrored.
    pub relocated_base: u8,
    pub pic_relocated: bool,
}

impl VcpiSession {
    pub fn new(page_dir: u32, page_table0: u32, scratch: u32) -> Self {
        Self {
            version: (0, 0),
            page_dir,
            page_table0,
            scratch,
            pmode_entry: 0,
            first_free_pte: 0,
            irq_window: IrqVectorWindow::default(),
            saved_irq_vectors: [0; 8],
            relocated_base: 0,
            pic_relocated: false,
        }
    }

    /// Linear address of the switch-data block (inside the scratch page,
    /// so both modes can address it).
    pub fn switch_data_linear(&self) -> u32 {
        self.scratch + SCRATCH_SWITCH_DATA
    }

    /// Real-mode far pointer to the descriptor exchange buffer.
    pub fn descriptor_buffer_ptr(&self) -> RealPtr {
        linear_to_real(self.scratch + SCRATCH_DESCRIPTORS)
    }

    /// Read back one of the three descriptors the host wrote into the
    /// exchange buffer.
    pub fn read_host_descriptor(&self, bus: &dyn HostBus, index: u32) -> Descriptor {
        let at = self.scratch + SCRATCH_DESCRIPTORS + index * 8;
        let low = bus.read_u32(at) as u64;
        let high = bus.read_u32(at + 4) as u64;
        Descriptor(low | (high << 32))
    }

    /// Zero page table 0 so host-filled entries are distinguishable.
    pub fn clear_page_table(&self, bus: &mut dyn HostBus) {
        for i in 0..(PAGE_SIZE / 4) {
            bus.write_u32(self.page_table0 + i * 4, 0);
        }
    }

    /// Verify the host's get-interface postconditions: the identity
    /// mapping must cover the first 1 MiB with valid user entries,
    /// frame == page everywhere, writable outside the ROM/video window.
    pub fn verify_identity_map(&self, bus: &dyn HostBus) -> Result<(), BootError> {
        let first_mb_ptes = (ONE_MB / PAGE_SIZE as u64) as u32;
        if self.first_free_pte < first_mb_ptes {
            return Err(BootError::ProtocolViolation(
                "VCPI identity map does not cover the first megabyte",
            ));
        }
        for i in 0..first_mb_ptes {
            let pte = bus.read_u32(self.page_table0 + i * 4);
            if pte & PTE_PRESENT == 0 || pte & PTE_USER == 0 {
                return Err(BootError::ProtocolViolation(
                    "VCPI page-table entry missing present/user bits",
                ));
            }
            let frame = pte & 0xFFFF_F000;
            if frame != i * PAGE_SIZE {
                return Err(BootError::ProtocolViolation(
                    "VCPI page-table entry is not an identity mapping",
                ));
            }
            // Only the write bit is relaxed in the ROM/video window.
            let in_rom_window = i * PAGE_SIZE >= ROM_WINDOW_START;
            if !in_rom_window && pte & PTE_WRITE == 0 {
                return Err(BootError::ProtocolViolation(
                    "VCPI identity mapping below the ROM window is read-only",
                ));
            }
        }
        Ok(())
    }

    /// Build the bootstrap page directory: entry 0 points at page table
    /// 0, everything else empty until the permanent mapping is built.
    pub fn build_page_dir(&self, bus: &mut dyn HostBus) {
        for i in 0..(PAGE_SIZE / 4) {
            bus.write_u32(self.page_dir + i * 4, 0);
        }
        bus.write_u32(
            self.page_dir,
            self.page_table0 | PTE_PRESENT | PTE_WRITE | PTE_USER,
        );
    }

    /// Write the switch-data block and the GDTR/IDTR images into the
    /// scratch page. The EIP/CS words stay zero; the switch trampoline
    /// patches them with the resume point right before the host call.
    pub fn write_switch_data(
        &self,
        bus: &mut dyn HostBus,
        gdt_limit: u16,
        gdt_base: u32,
        idt_limit: u16,
        idt_base: u32,
        ldt_sel: u16,
        tss_sel: u16,
    ) {
        let data = SwitchData {
            cr3: self.page_dir,
            gdtr_linear: self.scratch + SCRATCH_GDTR,
            idtr_linear: self.scratch + SCRATCH_IDTR,
            ldt_sel,
            tss_sel,
            eip: 0,
            cs: 0,
        };
        write_bytes(bus, self.switch_data_linear(), &data.to_bytes());

        let mut gdtr = [0u8; 6];
        gdtr[0..2].copy_from_slice(&gdt_limit.to_le_bytes());
        gdtr[2..6].copy_from_slice(&gdt_base.to_le_bytes());
        write_bytes(bus, self.scratch + SCRATCH_GDTR, &gdtr);

        let mut idtr = [0u8; 6];
        idtr[0..2].copy_from_slice(&idt_limit.to_le_bytes());
        idtr[2..6].copy_from_slice(&idt_base.to_le_bytes());
        write_bytes(bus, self.scratch + SCRATCH_IDTR, &idtr);
    }
}

/// Split a linear address below 1 MiB into a normalized seg:off pair.
pub fn linear_to_real(linear: u32) -> RealPtr {
    RealPtr::new((linear >> 4) as u16, (linear & 0xF) as u16)
}

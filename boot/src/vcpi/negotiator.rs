/// VCPI host negotiation state machine.
///
/// Walks UNPROBED → DETECTED → PMODE_ENTRY_OBTAINED → PAGE_TABLES_BUILT
/// → IRQ_WINDOW_NEGOTIATED → ACTIVE, falling back to the Raw backend when
/// no host is present (steps 1–3) and failing hard once resources have
/// been committed (steps 4+). Shutdown reverses exactly what was done and
/// is idempotent.
use crate::error::BootError;
use crate::host::{write_bytes, CpuMode, HostBus, RegisterBlock};
use crate::mem::pool::PhysMemPool;
use crate::mem::providers::{DosProvider, MemoryProvider};
use crate::mem::range::PAGE_SIZE;
use crate::mode::{bridge, Backend, ModeSwitch};
use crate::tables::{CpuTables, LDT_SEL, SLOT_VCPI_FIRST, TSS_SEL};

use super::irq;
use super::session::{
    linear_to_real, VcpiSession, PTE_PRESENT, PTE_USER, PTE_WRITE, SCRATCH_BYTES, VCPI_DETECT,
    VCPI_GET_INTERFACE,
};

/// EMM device-driver name probed through the DOS open protocol.
/// Compatibility-critical; do not change.
const EMM_DEVICE_NAME: &[u8; 9] = b"EMMXXXX0\0";

/// Fixed low-memory scratch for transient real-mode call data (the DOS
/// free area right after the BIOS data area).
const REALMODE_SCRATCH: u32 = 0x500;

const FOUR_MB: u64 = 0x40_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpiState {
    Unprobed,
    Detected,
    PmodeEntryObtained,
    PageTablesBuilt,
    IrqWindowNegotiated,
    Active,
    ShutDown,
}

pub struct VcpiNegotiator {
    state: VcpiState,
    version: (u8, u8),
    ems_handle: Option<u16>,
}

impl VcpiNegotiator {
    pub const fn new() -> Self {
        Self {
            state: VcpiState::Unprobed,
            version: (0, 0),
            ems_handle: None,
        }
    }

    pub fn state(&self) -> VcpiState {
        self.state
    }

    pub fn version(&self) -> Option<(u8, u8)> {
        if self.state == VcpiState::Unprobed {
            None
        } else {
            Some(self.version)
        }
    }

    /// Steps 1–7 of the negotiation, run in real mode before the first
    /// switch. `Ok(None)` means no VCPI host (not an error - the caller
    /// stays on the Raw backend). `Err` past step 3 means the VCPI path
    /// died after committing resources.
    pub fn prepare(
        &mut self,
        bus: &mut dyn HostBus,
        dos: &mut DosProvider,
        tables: &mut CpuTables,
    ) -> Result<Option<VcpiSession>, BootError> {
        // 1. EMM device driver present? Absence ends negotiation quietly.
        if !detect_emm_driver(bus) {
            return Ok(None);
        }

        // 2. Pin the EMM active by holding one EMS page. Best effort;
        // failure does not abort negotiation.
        self.ems_handle = alloc_ems_page(bus);

        // 3. VCPI presence/version.
        let mut regs = RegisterBlock::default();
        regs.set_ax(VCPI_DETECT);
        bus.real_int(0x67, &mut regs);
        if regs.ah() != 0 {
            self.release_ems(bus);
            return Ok(None);
        }
        self.version = ((regs.ebx >> 8) as u8, regs.ebx as u8);
        self.state = VcpiState::Detected;

        // 4. Two low DOS pages for the bootstrap page directory/table,
        // plus the small scratch block both modes must address. Fatal to
        // the VCPI path if low memory is gone.
        let pages = dos
            .reserve_low(2 * PAGE_SIZE, PAGE_SIZE)
            .ok_or(BootError::ResourceExhausted(
                "low DOS memory for VCPI page tables",
            ))?;
        let scratch = dos
            .reserve_low(SCRATCH_BYTES, 16)
            .ok_or(BootError::ResourceExhausted(
                "low DOS memory for VCPI scratch",
            ))?;
        let mut session = VcpiSession::new(pages, pages + PAGE_SIZE, scratch);
        session.version = self.version;

        // 5. Get the host's protected-mode interface and verify its
        // postconditions before trusting a single mapping.
        self.get_interface(bus, &mut session, tables)?;
        self.state = VcpiState::PmodeEntryObtained;

        session.build_page_dir(bus);
        self.state = VcpiState::PageTablesBuilt;

        // 6. Hardware-IRQ vector window, relocating away from the CPU
        // exceptions if the host insists on the default.
        irq::negotiate(bus, &mut session)?;
        self.state = VcpiState::IrqWindowNegotiated;

        // 7. Switch-data block for the first (and every later) mediated
        // transition. The caller upgrades the backend and performs the
        // switch.
        let frame = tables.switch_frame();
        session.write_switch_data(
            bus,
            frame.gdt_limit,
            frame.gdt_base,
            frame.idt_limit,
            frame.idt_base,
            LDT_SEL,
            TSS_SEL,
        );

        Ok(Some(session))
    }

    /// `int 0x67, AX=0xDE01`: hand the host page table 0 and three GDT
    /// slots, take back the pmode entry point and the first-unmapped-PTE
    /// index, then verify everything the host claims.
    fn get_interface(
        &mut self,
        bus: &mut dyn HostBus,
        session: &mut VcpiSession,
        tables: &mut CpuTables,
    ) -> Result<(), BootError> {
        session.clear_page_table(bus);

        let table_ptr = linear_to_real(session.page_table0);
        let desc_ptr = session.descriptor_buffer_ptr();

        let mut regs = RegisterBlock::default();
        regs.set_ax(VCPI_GET_INTERFACE);
        regs.es = table_ptr.segment;
        regs.edi = table_ptr.offset as u32;
        regs.ds = desc_ptr.segment;
        regs.esi = desc_ptr.offset as u32;
        bus.real_int(0x67, &mut regs);
        if regs.ah() != 0 {
            return Err(BootError::ProtocolViolation("VCPI get-interface failed"));
        }

        session.pmode_entry = regs.ebx;
        let end_linear = ((regs.es as u32) << 4) + (regs.edi & 0xFFFF);
        if end_linear < session.page_table0 {
            return Err(BootError::ProtocolViolation(
                "VCPI get-interface returned a bogus PTE cursor",
            ));
        }
        session.first_free_pte = (end_linear - session.page_table0) / 4;

        // The host's code descriptor must be usable before we ever jump
        // through it.
        let code = session.read_host_descriptor(bus, 0);
        if !code.present() || !code.executable() {
            return Err(BootError::ProtocolViolation(
                "VCPI host code descriptor not present/executable",
            ));
        }
        for i in 0..3 {
            let d = session.read_host_descriptor(bus, i);
            tables.install_raw(SLOT_VCPI_FIRST + i as usize, d.0);
        }

        session.verify_identity_map(bus)
    }

    /// Step 8, first half - runs right after the first VCPI-mediated
    /// switch, in protected mode under the bootstrap identity window.
    ///
    /// Order is load-bearing. The DOS low memory is merged first (safe -
    /// the host-verified identity window covers it), because building the
    /// permanent all-RAM mapping consumes pool pages and those pages must
    /// themselves be mapped. The permanent directory then replaces the
    /// bootstrap one in the switch data; the two bootstrap pages go back
    /// to the pool only after that. They stay referenced until the
    /// activation round trip loads the new directory, and nothing
    /// allocates in between. `map_limit` is the highest physical address
    /// any provider stashed.
    pub fn finish_pmode(
        &mut self,
        bus: &mut dyn HostBus,
        switch: &mut ModeSwitch,
        tables: &mut CpuTables,
        pool: &mut PhysMemPool,
        dos: &mut DosProvider,
        map_limit: u64,
    ) -> Result<(), BootError> {
        debug_assert_eq!(self.state, VcpiState::IrqWindowNegotiated);
        debug_assert_eq!(bus.mode(), CpuMode::Pmode);

        let (old_dir, old_table0, host_ptes) = match switch.backend() {
            Backend::Vcpi(s) => (s.page_dir, s.page_table0, s.first_free_pte),
            Backend::Raw => {
                return Err(BootError::ProtocolViolation(
                    "finish_pmode without a VCPI backend",
                ))
            }
        };

        dos.collect(bus, switch, pool)?;

        let new_dir = build_permanent_map(bus, pool, old_table0, host_ptes, map_limit)?;

        let frame = tables.switch_frame();
        if let Backend::Vcpi(s) = switch.backend_mut() {
            s.page_dir = new_dir;
        }
        if let Backend::Vcpi(s) = switch.backend() {
            s.write_switch_data(
                bus,
                frame.gdt_limit,
                frame.gdt_base,
                frame.idt_limit,
                frame.idt_base,
                LDT_SEL,
                TSS_SEL,
            );
        }

        pool.add(old_dir as u64, 2 * PAGE_SIZE as u64)?;

        // Tables are addressed linearly; reload them now that the final
        // mapping is the one every later transition will install.
        tables.load();
        switch.set_frame(frame);
        Ok(())
    }

    /// Step 8, second half - after the caller re-collected memory: one
    /// extra real→pmode round trip as a self-test, then ACTIVE.
    pub fn activate(
        &mut self,
        bus: &mut dyn HostBus,
        switch: &mut ModeSwitch,
    ) -> Result<(), BootError> {
        debug_assert_eq!(self.state, VcpiState::IrqWindowNegotiated);

        switch.to_real(bus)?;
        switch.to_pmode(bus)?;
        if bus.mode() != CpuMode::Pmode {
            return Err(BootError::ProtocolViolation(
                "mode-switch self-test did not land in protected mode",
            ));
        }

        self.state = VcpiState::Active;
        Ok(())
    }

    /// Reverse whatever was actually done: relocated PIC and vectors
    /// first, then the EMS page. Idempotent; later calls are no-ops.
    pub fn shutdown(
        &mut self,
        bus: &mut dyn HostBus,
        switch: &mut ModeSwitch,
    ) -> Result<(), BootError> {
        if self.state == VcpiState::ShutDown {
            return Ok(());
        }

        let relocated = match switch.backend() {
            Backend::Vcpi(s) if s.pic_relocated => Some((s.irq_window, s.relocated_base)),
            _ => None,
        };

        if relocated.is_some() {
            let saved_flags = bus.eflags();
            bus.cli();

            if let Backend::Vcpi(s) = switch.backend() {
                irq::restore_pic(bus, s);
            }

            let mut regs = RegisterBlock::default();
            regs.set_ax(super::session::VCPI_SET_IRQ_WINDOW);
            regs.ebx = crate::pic::BIOS_MASTER_BASE as u32;
            regs.ecx = crate::pic::BIOS_SLAVE_BASE as u32;
            bridge::real_int(switch, bus, 0x67, &mut regs)?;

            if let Backend::Vcpi(s) = switch.backend_mut() {
                irq::restore_vectors(bus, s);
                s.pic_relocated = false;
            }

            bus.set_eflags(saved_flags);
        }

        if let Some(handle) = self.ems_handle.take() {
            let mut regs = RegisterBlock::default();
            regs.set_ax(0x4500);
            regs.edx = handle as u32;
            bridge::real_int(switch, bus, 0x67, &mut regs)?;
        }

        self.state = VcpiState::ShutDown;
        Ok(())
    }

    fn release_ems(&mut self, bus: &mut dyn HostBus) {
        if let Some(handle) = self.ems_handle.take() {
            let mut regs = RegisterBlock::default();
            regs.set_ax(0x4500);
            regs.edx = handle as u32;
            bus.real_int(0x67, &mut regs);
        }
    }
}

/// Step 1: DOS driver-name probe for the EMM. Open `"EMMXXXX0"`, confirm
/// it is a character device whose output status reads ready, close it.
fn detect_emm_driver(bus: &mut dyn HostBus) -> bool {
    write_bytes(bus, REALMODE_SCRATCH, EMM_DEVICE_NAME);
    let name_ptr = linear_to_real(REALMODE_SCRATCH);

    let mut regs = RegisterBlock::default();
    regs.set_ax(0x3D00); // open, read-only
    regs.ds = name_ptr.segment;
    regs.edx = name_ptr.offset as u32;
    bus.real_int(0x21, &mut regs);
    if regs.carry() {
        return false;
    }
    let handle = regs.eax as u16;

    // IOCTL get device info: must be a character device.
    let mut regs = RegisterBlock::default();
    regs.set_ax(0x4400);
    regs.ebx = handle as u32;
    bus.real_int(0x21, &mut regs);
    let is_char_device = !regs.carry() && regs.edx & 0x80 != 0;

    // IOCTL get output status: 0xFF = ready.
    let mut regs = RegisterBlock::default();
    regs.set_ax(0x4407);
    regs.ebx = handle as u32;
    bus.real_int(0x21, &mut regs);
    let ready = !regs.carry() && regs.al() == 0xFF;

    let mut regs = RegisterBlock::default();
    regs.set_ax(0x3E00);
    regs.ebx = handle as u32;
    bus.real_int(0x21, &mut regs);

    is_char_device && ready
}

/// Step 2: allocate one EMS page to force the EMM active.
fn alloc_ems_page(bus: &mut dyn HostBus) -> Option<u16> {
    let mut regs = RegisterBlock::default();
    regs.set_ax(0x4300);
    regs.ebx = 1;
    bus.real_int(0x67, &mut regs);
    if regs.ah() == 0 {
        Some(regs.edx as u16)
    } else {
        None
    }
}

/// Build the permanent identity mapping covering `[0, map_limit)` in
/// freshly pooled pages. The first-megabyte entries the host filled are
/// carried over verbatim - the host may map the ROM window or the boot
/// image specially. Mechanism only; the kernel proper owns paging policy.
///
/// Pool allocation takes from the top of the highest region, and at this
/// point the pool holds only the DOS arena, so every page handed out is
/// below 1 MiB and inside the verified identity window.
fn build_permanent_map(
    bus: &mut dyn HostBus,
    pool: &mut PhysMemPool,
    old_table0: u32,
    host_ptes: u32,
    map_limit: u64,
) -> Result<u32, BootError> {
    let dir = pool.alloc_pages(1)? as u32;
    for i in 0..(PAGE_SIZE / 4) {
        bus.write_u32(dir + i * 4, 0);
    }

    let pde_count = (((map_limit + FOUR_MB - 1) / FOUR_MB) as u32).clamp(1, 1024);
    for pde_idx in 0..pde_count {
        let table = pool.alloc_pages(1)? as u32;
        for i in 0..(PAGE_SIZE / 4) {
            let frame = pde_idx as u64 * FOUR_MB + (i as u64) * PAGE_SIZE as u64;
            let pte = if pde_idx == 0 && i < host_ptes.min(PAGE_SIZE / 4) {
                bus.read_u32(old_table0 + i * 4)
            } else if frame < map_limit {
                frame as u32 | PTE_PRESENT | PTE_WRITE | PTE_USER
            } else {
                0
            };
            bus.write_u32(table + i * 4, pte);
        }
        bus.write_u32(
            dir + pde_idx * 4,
            table | PTE_PRESENT | PTE_WRITE | PTE_USER,
        );
    }
    Ok(dir)
}

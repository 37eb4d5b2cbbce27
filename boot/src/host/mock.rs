/// Simulated PC for host-target tests.
///
/// Models exactly what the bootstrap negotiates with: a flat memory image
/// with a populated interrupt vector table, the DOS/EMS/VCPI/XMS/BIOS
/// real-mode services, both 8259 controllers, the A20 paths, and the mode
/// transitions themselves. Protocol quirks (a host insisting on vector
/// base 8, a wedged keyboard controller, a short identity map) are
/// switchable per test.
use alloc::vec;
use alloc::vec::Vec;

use crate::tables::{Descriptor, SizeFlag};

use super::{CpuMode, HostBus, RealPtr, RegisterBlock, SwitchDirection, SwitchFrame, FLAG_IF};

/// Parked-vector stub every unused IVT entry points at.
const PARKED_VECTOR: u32 = 0xF000_FF53;

const DOS_EMM_HANDLE: u16 = 5;
const XMS_ENTRY: RealPtr = RealPtr::new(0x9000, 0x0100);

const PTE_PRESENT: u32 = 1 << 0;
const PTE_WRITE: u32 = 1 << 1;
const PTE_USER: u32 = 1 << 2;

/// Things the machine observed, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    RawEnterPmode,
    RawLeavePmode,
    VcpiSwitch(SwitchDirection),
    Clts,
    RealIdtLoaded,
    RealInt(u8),
    XmsCall(u8),
    A20Changed(bool),
    PicRemapped(u8, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PicInit {
    Idle,
    AwaitIcw2,
    AwaitIcw3,
    AwaitIcw4,
}

struct Pic {
    init: PicInit,
    vector_base: u8,
    mask: u8,
}

impl Pic {
    fn new(vector_base: u8) -> Self {
        Self {
            init: PicInit::Idle,
            vector_base,
            mask: 0xB8,
        }
    }

    fn write_cmd(&mut self, val: u8) {
        if val == 0x11 {
            self.init = PicInit::AwaitIcw2;
        }
    }

    /// Returns the new vector base when the init sequence completes.
    fn write_data(&mut self, val: u8) -> Option<u8> {
        match self.init {
            PicInit::Idle => {
                self.mask = val;
                None
            }
            PicInit::AwaitIcw2 => {
                self.vector_base = val;
                self.init = PicInit::AwaitIcw3;
                None
            }
            PicInit::AwaitIcw3 => {
                self.init = PicInit::AwaitIcw4;
                None
            }
            PicInit::AwaitIcw4 => {
                self.init = PicInit::Idle;
                Some(self.vector_base)
            }
        }
    }
}

pub struct MockHost {
    mem: Vec<u8>,
    mode: CpuMode,
    eflags: u32,
    a20: bool,
    events: Vec<Event>,

    // ---- Keyboard controller ----
    /// Status-port reads left before the input buffer reads clear.
    /// `u32::MAX` wedges the controller for timeout tests.
    pub kbc_busy_polls: u32,
    kbc_expect_output: bool,

    // ---- System control port A ----
    port92: u8,
    /// Set if anything ever wrote bit 0 (the reset pulse) back high.
    pub reset_pulsed: bool,

    // ---- PICs ----
    master_pic: Pic,
    slave_pic: Pic,

    // ---- DOS ----
    pub conventional_kb: u16,
    pub dos_largest_paras: u16,
    pub dos_alloc_segment: u16,
    dos_allocated: bool,
    emm_open_handle: Option<u16>,

    // ---- EMM / EMS / VCPI ----
    pub emm_present: bool,
    pub vcpi_present: bool,
    pub vcpi_version: u16,
    pub vcpi_pmode_entry: u32,
    pub vcpi_master_base: u8,
    pub vcpi_slave_base: u8,
    pub vcpi_max_phys: u32,
    pub vcpi_free_pages: Vec<u32>,
    /// Inject protocol violations the negotiator must catch.
    pub vcpi_bad_descriptor: bool,
    pub vcpi_bad_pte: bool,
    pub vcpi_bad_rom_pte: bool,
    pub vcpi_short_map: bool,
    pub vcpi_reject_window: bool,
    /// Master/slave bases last reported to the host via set-IRQ-window.
    pub informed_window: Option<(u8, u8)>,
    ems_next_handle: u16,
    pub ems_live_handles: Vec<u16>,

    // ---- XMS ----
    pub xms_present: bool,
    pub xms_largest_kb: u16,
    pub xms_lock_base: u32,
    pub xms_live_handles: Vec<u16>,
    xms_next_handle: u16,

    // ---- BIOS extended-memory reporting ----
    pub e801_supported: bool,
    pub e801_low_kb: u16,
    pub e801_high_64k: u16,
    pub int88_kb: u16,

    // ---- DPMI ----
    pub dpmi_present: bool,
}

impl MockHost {
    /// A 4 MiB machine with 640 KiB conventional memory, a free DOS
    /// arena, parked high vectors, and every service absent until a test
    /// turns it on.
    pub fn new() -> Self {
        let mut host = Self {
            mem: vec![0u8; 0x40_0000],
            mode: CpuMode::Real,
            eflags: FLAG_IF | 0x2,
            a20: false,
            events: Vec::new(),
            kbc_busy_polls: 0,
            kbc_expect_output: false,
            port92: 0,
            reset_pulsed: false,
            master_pic: Pic::new(0x08),
            slave_pic: Pic::new(0x70),
            conventional_kb: 640,
            dos_largest_paras: 0x6000, // 384 KiB at segment 0x2000
            dos_alloc_segment: 0x2000,
            dos_allocated: false,
            emm_open_handle: None,
            emm_present: false,
            vcpi_present: false,
            vcpi_version: 0x0100,
            vcpi_pmode_entry: 0x0000_1234,
            vcpi_master_base: 0x08,
            vcpi_slave_base: 0x70,
            vcpi_max_phys: 0x003F_F000,
            vcpi_free_pages: (0..64).map(|i| 0x0018_0000 + i * 0x1000).collect(),
            vcpi_bad_descriptor: false,
            vcpi_bad_pte: false,
            vcpi_bad_rom_pte: false,
            vcpi_short_map: false,
            vcpi_reject_window: false,
            informed_window: None,
            ems_next_handle: 1,
            ems_live_handles: Vec::new(),
            xms_present: false,
            xms_largest_kb: 0x0C00, // 3 MiB
            xms_lock_base: 0x0011_0000,
            xms_live_handles: Vec::new(),
            xms_next_handle: 1,
            e801_supported: true,
            e801_low_kb: 0x0C00,
            e801_high_64k: 0,
            int88_kb: 0x0C00,
            dpmi_present: false,
        };
        host.init_ivt();
        host
    }

    /// A machine running an EMM with VCPI services.
    pub fn with_vcpi() -> Self {
        let mut host = Self::new();
        host.emm_present = true;
        host.vcpi_present = true;
        host
    }

    fn init_ivt(&mut self) {
        // Exceptions and BIOS services get distinct handlers; the
        // hardware IRQ vectors (8..16) likewise so relocation mirroring
        // is observable.
        for v in 0u32..0x80 {
            self.write_u32_raw(v * 4, 0xF000_1000 + v * 0x10);
        }
        // Everything above is parked on one stub, giving the vector-run
        // scan a window to find.
        for v in 0x80u32..0x100 {
            self.write_u32_raw(v * 4, PARKED_VECTOR);
        }
    }

    /// Defeat the free-vector heuristic: no 8 identical high vectors.
    pub fn scatter_high_vectors(&mut self) {
        for v in 0x20u32..0x100 {
            self.write_u32_raw(v * 4, 0xBAD0_0000 + v);
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn pic_bases(&self) -> (u8, u8) {
        (self.master_pic.vector_base, self.slave_pic.vector_base)
    }

    pub fn pic_masks(&self) -> (u8, u8) {
        (self.master_pic.mask, self.slave_pic.mask)
    }

    pub fn set_pic_masks(&mut self, master: u8, slave: u8) {
        self.master_pic.mask = master;
        self.slave_pic.mask = slave;
    }

    pub fn ivt_entry(&self, vector: u8) -> u32 {
        self.read_u32(vector as u32 * 4)
    }

    pub fn set_ivt_entry(&mut self, vector: u8, value: u32) {
        self.write_u32_raw(vector as u32 * 4, value);
    }

    pub fn set_a20(&mut self, on: bool) {
        self.a20 = on;
        self.port92 = (self.port92 & !0x02) | if on { 0x02 } else { 0 };
    }

    fn write_u32_raw(&mut self, at: u32, val: u32) {
        self.mem[at as usize..at as usize + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn record_a20(&mut self, on: bool) {
        if self.a20 != on {
            self.a20 = on;
            self.events.push(Event::A20Changed(on));
        }
        self.port92 = (self.port92 & !0x02) | if on { 0x02 } else { 0 };
    }

    // ---- Real-mode service handlers ----

    fn int_dos(&mut self, regs: &mut RegisterBlock) {
        match regs.ah() {
            0x3D => {
                let name_at = RealPtr::new(regs.ds, regs.edx as u16).linear();
                let mut name = [0u8; 8];
                for (i, b) in name.iter_mut().enumerate() {
                    *b = self.read_u8(name_at + i as u32);
                }
                if self.emm_present && &name == b"EMMXXXX0" {
                    self.emm_open_handle = Some(DOS_EMM_HANDLE);
                    regs.eax = DOS_EMM_HANDLE as u32;
                    set_carry(regs, false);
                } else {
                    regs.eax = 0x02; // file not found
                    set_carry(regs, true);
                }
            }
            0x44 => {
                let is_emm = self.emm_open_handle == Some(regs.ebx as u16);
                match regs.al() {
                    0x00 => {
                        // Device info word: bit 7 = character device.
                        regs.edx = if is_emm { 0x80 } else { 0x00 };
                        set_carry(regs, false);
                    }
                    0x07 => {
                        set_al(regs, if is_emm { 0xFF } else { 0x00 });
                        set_carry(regs, false);
                    }
                    _ => set_carry(regs, true),
                }
            }
            0x3E => {
                if self.emm_open_handle == Some(regs.ebx as u16) {
                    self.emm_open_handle = None;
                }
                set_carry(regs, false);
            }
            0x48 => {
                let want = regs.ebx as u16;
                if self.dos_allocated || want > self.dos_largest_paras {
                    regs.eax = 0x08; // insufficient memory
                    regs.ebx = if self.dos_allocated {
                        0
                    } else {
                        self.dos_largest_paras as u32
                    };
                    set_carry(regs, true);
                } else {
                    self.dos_allocated = true;
                    regs.eax = self.dos_alloc_segment as u32;
                    set_carry(regs, false);
                }
            }
            0x49 => {
                self.dos_allocated = false;
                set_carry(regs, false);
            }
            _ => set_carry(regs, true),
        }
    }

    fn int_bios_conventional(&mut self, regs: &mut RegisterBlock) {
        regs.eax = self.conventional_kb as u32;
    }

    fn int_bios_extended(&mut self, regs: &mut RegisterBlock) {
        if regs.eax & 0xFFFF == 0xE801 && self.e801_supported {
            regs.eax = self.e801_low_kb as u32;
            regs.ebx = self.e801_high_64k as u32;
            regs.ecx = self.e801_low_kb as u32;
            regs.edx = self.e801_high_64k as u32;
            set_carry(regs, false);
        } else if regs.ah() == 0x88 {
            regs.eax = self.int88_kb as u32;
            set_carry(regs, false);
        } else {
            set_carry(regs, true);
        }
    }

    fn int_multiplex(&mut self, regs: &mut RegisterBlock) {
        match regs.eax & 0xFFFF {
            0x4300 => {
                set_al(regs, if self.xms_present { 0x80 } else { 0x00 });
            }
            0x4310 => {
                if self.xms_present {
                    regs.es = XMS_ENTRY.segment;
                    regs.ebx = XMS_ENTRY.offset as u32;
                }
            }
            0x1687 => {
                regs.eax = if self.dpmi_present { 0 } else { 1 };
            }
            _ => {}
        }
    }

    fn int_emm(&mut self, regs: &mut RegisterBlock) {
        if !self.emm_present {
            set_ah(regs, 0xFF);
            return;
        }
        match regs.ah() {
            0x43 => {
                // EMS allocate pages.
                let handle = self.ems_next_handle;
                self.ems_next_handle += 1;
                self.ems_live_handles.push(handle);
                regs.edx = handle as u32;
                set_ah(regs, 0);
            }
            0x45 => {
                let handle = regs.edx as u16;
                self.ems_live_handles.retain(|h| *h != handle);
                set_ah(regs, 0);
            }
            0xDE => self.vcpi_call(regs),
            _ => set_ah(regs, 0x84), // invalid function
        }
    }

    fn vcpi_call(&mut self, regs: &mut RegisterBlock) {
        if !self.vcpi_present {
            set_ah(regs, 0x84);
            return;
        }
        match regs.al() {
            0x00 => {
                regs.ebx = self.vcpi_version as u32;
                set_ah(regs, 0);
            }
            0x01 => self.vcpi_get_interface(regs),
            0x02 => {
                regs.edx = self.vcpi_max_phys;
                set_ah(regs, 0);
            }
            0x03 => {
                regs.edx = self.vcpi_free_pages.len() as u32;
                set_ah(regs, 0);
            }
            0x04 => match self.vcpi_free_pages.pop() {
                Some(page) => {
                    regs.edx = page;
                    set_ah(regs, 0);
                }
                None => set_ah(regs, 0x88),
            },
            0x0A => {
                regs.ebx = self.vcpi_master_base as u32;
                regs.ecx = self.vcpi_slave_base as u32;
                set_ah(regs, 0);
            }
            0x0B => {
                if self.vcpi_reject_window {
                    set_ah(regs, 0x8F);
                } else {
                    self.informed_window = Some((regs.ebx as u8, regs.ecx as u8));
                    set_ah(regs, 0);
                }
            }
            _ => set_ah(regs, 0x84),
        }
    }

    /// `DE01`: fill the client's page table 0 with the first-megabyte
    /// identity mapping, write the 3 host descriptors, return the pmode
    /// entry offset and the advanced PTE cursor.
    fn vcpi_get_interface(&mut self, regs: &mut RegisterBlock) {
        let table = RealPtr::new(regs.es, regs.edi as u16).linear();
        let desc_buf = RealPtr::new(regs.ds, regs.esi as u16).linear();

        let filled: u32 = if self.vcpi_short_map { 0x80 } else { 0x100 };
        for i in 0..filled {
            let mut pte = (i << 12) | PTE_PRESENT | PTE_USER;
            if i < 0xA0 {
                pte |= PTE_WRITE;
            }
            if self.vcpi_bad_pte && i == 5 {
                pte = (0x5000 << 12) | PTE_PRESENT | PTE_USER | PTE_WRITE;
            }
            if self.vcpi_bad_rom_pte && i == 0xA5 {
                // Host remaps a video page elsewhere instead of identity.
                pte = (0x0300 << 12) | PTE_PRESENT | PTE_USER;
            }
            self.write_u32_raw(table + i * 4, pte);
        }

        let code_access: u8 = if self.vcpi_bad_descriptor { 0x1A } else { 0x9A };
        let descriptors = [
            Descriptor::encode(0x000C_0000, 0xFFFF, code_access, SizeFlag::Bits32),
            Descriptor::encode(0x000C_0000, 0xFFFF, 0x92, SizeFlag::Bits32),
            Descriptor::encode(0, 0xFFFF_FFFF, 0x92, SizeFlag::Bits32),
        ];
        for (i, d) in descriptors.iter().enumerate() {
            self.write_u32_raw(desc_buf + i as u32 * 8, d.0 as u32);
            self.write_u32_raw(desc_buf + i as u32 * 8 + 4, (d.0 >> 32) as u32);
        }

        regs.ebx = self.vcpi_pmode_entry;
        regs.edi = (regs.edi & 0xFFFF) + filled * 4;
        set_ah(regs, 0);
    }

    fn xms_call(&mut self, regs: &mut RegisterBlock) {
        let func = regs.ah();
        self.events.push(Event::XmsCall(func));
        match func {
            0x00 => regs.eax = 0x0300, // version 3.0
            0x03 | 0x05 => {
                self.record_a20(true);
                regs.eax = 1;
            }
            0x04 | 0x06 => {
                self.record_a20(false);
                regs.eax = 1;
            }
            0x07 => regs.eax = self.a20 as u32,
            0x08 => {
                regs.eax = self.xms_largest_kb as u32;
                regs.edx = self.xms_largest_kb as u32;
            }
            0x09 => {
                let handle = self.xms_next_handle;
                self.xms_next_handle += 1;
                self.xms_live_handles.push(handle);
                regs.edx = handle as u32;
                regs.eax = 1;
            }
            0x0A | 0x0D => {
                if func == 0x0A {
                    let handle = regs.edx as u16;
                    self.xms_live_handles.retain(|h| *h != handle);
                }
                regs.eax = 1;
            }
            0x0C => {
                regs.edx = self.xms_lock_base >> 16;
                regs.ebx = self.xms_lock_base & 0xFFFF;
                regs.eax = 1;
            }
            _ => {
                regs.eax = 0;
                set_carry(regs, true);
            }
        }
    }
}

impl HostBus for MockHost {
    fn outb(&mut self, port: u16, val: u8) {
        match port {
            0x20 => self.master_pic.write_cmd(val),
            0x21 => {
                if self.master_pic.write_data(val).is_some() {
                    let bases = self.pic_bases();
                    self.events.push(Event::PicRemapped(bases.0, bases.1));
                }
            }
            0xA0 => self.slave_pic.write_cmd(val),
            0xA1 => {
                let _ = self.slave_pic.write_data(val);
            }
            0x64 => {
                self.kbc_expect_output = val == 0xD1;
            }
            0x60 => {
                if self.kbc_expect_output {
                    self.kbc_expect_output = false;
                    self.record_a20(val & 0x02 != 0);
                }
            }
            0x92 => {
                if val & 0x01 != 0 {
                    self.reset_pulsed = true;
                }
                self.port92 = val & !0x01;
                self.record_a20(val & 0x02 != 0);
            }
            0x80 => {}
            _ => {}
        }
    }

    fn inb(&mut self, port: u16) -> u8 {
        match port {
            0x21 => self.master_pic.mask,
            0xA1 => self.slave_pic.mask,
            0x64 => {
                if self.kbc_busy_polls > 0 {
                    if self.kbc_busy_polls != u32::MAX {
                        self.kbc_busy_polls -= 1;
                    }
                    0x02
                } else {
                    0x00
                }
            }
            0x92 => self.port92,
            _ => 0xFF,
        }
    }

    fn cli(&mut self) {
        self.eflags &= !FLAG_IF;
    }

    fn eflags(&self) -> u32 {
        self.eflags
    }

    fn set_eflags(&mut self, flags: u32) {
        self.eflags = flags;
    }

    fn read_u8(&self, linear: u32) -> u8 {
        self.mem[linear as usize]
    }

    fn write_u8(&mut self, linear: u32, val: u8) {
        self.mem[linear as usize] = val;
    }

    fn read_u32(&self, linear: u32) -> u32 {
        let at = linear as usize;
        u32::from_le_bytes([
            self.mem[at],
            self.mem[at + 1],
            self.mem[at + 2],
            self.mem[at + 3],
        ])
    }

    fn write_u32(&mut self, linear: u32, val: u32) {
        self.write_u32_raw(linear, val);
    }

    fn a20_enabled(&self) -> bool {
        self.a20
    }

    fn real_int(&mut self, vector: u8, regs: &mut RegisterBlock) {
        assert_eq!(self.mode, CpuMode::Real, "real_int outside real mode");
        self.events.push(Event::RealInt(vector));
        match vector {
            0x12 => self.int_bios_conventional(regs),
            0x15 => self.int_bios_extended(regs),
            0x21 => self.int_dos(regs),
            0x2F => self.int_multiplex(regs),
            0x67 => self.int_emm(regs),
            _ => set_carry(regs, true),
        }
    }

    fn real_far_call(&mut self, entry: RealPtr, regs: &mut RegisterBlock) {
        assert_eq!(self.mode, CpuMode::Real, "far call outside real mode");
        assert_eq!(entry, XMS_ENTRY, "far call to unknown entry point");
        self.xms_call(regs);
    }

    fn raw_enter_pmode(&mut self, _frame: &SwitchFrame) {
        assert_eq!(self.mode, CpuMode::Real);
        self.events.push(Event::RawEnterPmode);
        self.mode = CpuMode::Pmode;
    }

    fn raw_leave_pmode(&mut self, _frame: &SwitchFrame) {
        assert_eq!(self.mode, CpuMode::Pmode);
        self.events.push(Event::RawLeavePmode);
        self.mode = CpuMode::Real;
    }

    fn vcpi_switch(&mut self, switch_data: u32, dir: SwitchDirection) {
        self.events.push(Event::VcpiSwitch(dir));
        match dir {
            SwitchDirection::ToPmode => {
                assert_eq!(self.mode, CpuMode::Real);
                // The host dereferences CR3 immediately; a dead page
                // directory must fail loudly here, not on real hardware.
                let cr3 = self.read_u32(switch_data);
                let pde0 = self.read_u32(cr3);
                assert!(pde0 & PTE_PRESENT != 0, "switch with no bootstrap mapping");
                self.mode = CpuMode::Pmode;
            }
            SwitchDirection::ToReal => {
                assert_eq!(self.mode, CpuMode::Pmode);
                self.mode = CpuMode::Real;
            }
        }
    }

    fn clts(&mut self) {
        self.events.push(Event::Clts);
    }

    fn load_real_idt(&mut self) {
        self.events.push(Event::RealIdtLoaded);
    }

    fn mode(&self) -> CpuMode {
        self.mode
    }
}

fn set_carry(regs: &mut RegisterBlock, on: bool) {
    if on {
        regs.flags |= 0x01;
    } else {
        regs.flags &= !0x01;
    }
}

fn set_ah(regs: &mut RegisterBlock, val: u8) {
    regs.eax = (regs.eax & !0xFF00) | ((val as u32) << 8);
}

fn set_al(regs: &mut RegisterBlock, val: u8) {
    regs.eax = (regs.eax & !0xFF) | val as u32;
}

/// Per-CPU descriptor tables (GDT/IDT/LDT/TSS) for 32-bit protected mode.
///
/// One `CpuTables` per logical CPU, exclusively owning its four tables.
/// Entries are written through one constructor path (`fill`); `fill` does
/// no validation - garbage in, garbage out - and malformed descriptors
/// manifest only as later faults. The tables are addressed *linearly*, so
/// `load` must be re-invoked after any change to the physical-to-linear
/// offset.
use core::mem::size_of;

use crate::host::SwitchFrame;

#[cfg(test)]
mod tests;

/// Segment descriptor (8 bytes).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Descriptor(pub u64);

/// Default-operation-size flag (the D/B bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeFlag {
    Bits16,
    Bits32,
}

impl Descriptor {
    pub const fn null() -> Self {
        Self(0)
    }

    /// Encode a descriptor. Limits of 1 MiB and above are rounded up to
    /// page granularity (G=1), matching how the CPU interprets them.
    pub fn encode(base: u32, limit: u32, access: u8, size: SizeFlag) -> Self {
        let (gran, limit_field) = if limit > 0xF_FFFF {
            (1u64, (limit >> 12) as u64)
        } else {
            (0u64, limit as u64)
        };
        let d_bit = match size {
            SizeFlag::Bits16 => 0u64,
            SizeFlag::Bits32 => 1u64,
        };
        let base = base as u64;

        let raw = (limit_field & 0xFFFF)
            | ((base & 0xFFFF) << 16)
            | (((base >> 16) & 0xFF) << 32)
            | ((access as u64) << 40)
            | (((limit_field >> 16) & 0xF) << 48)
            | (d_bit << 54)
            | (gran << 55)
            | (((base >> 24) & 0xFF) << 56);
        Self(raw)
    }

    // ---- Read-back accessors (round-trip verification, VCPI
    //      postcondition checks) ----

    pub fn base(self) -> u32 {
        let raw = self.0;
        (((raw >> 16) & 0xFFFF) | (((raw >> 32) & 0xFF) << 16) | (((raw >> 56) & 0xFF) << 24))
            as u32
    }

    /// Limit in bytes, granularity applied.
    pub fn limit(self) -> u32 {
        let raw_limit = ((self.0 & 0xFFFF) | (((self.0 >> 48) & 0xF) << 16)) as u32;
        if self.granular() {
            (raw_limit << 12) | 0xFFF
        } else {
            raw_limit
        }
    }

    pub fn access(self) -> u8 {
        (self.0 >> 40) as u8
    }

    pub fn size(self) -> SizeFlag {
        if (self.0 >> 54) & 1 != 0 {
            SizeFlag::Bits32
        } else {
            SizeFlag::Bits16
        }
    }

    pub fn granular(self) -> bool {
        (self.0 >> 55) & 1 != 0
    }

    pub fn present(self) -> bool {
        self.access() & 0x80 != 0
    }

    pub fn executable(self) -> bool {
        // Code/data bit of a non-system descriptor.
        self.access() & 0x18 == 0x18
    }
}

/// Interrupt/trap gate (8 bytes, 32-bit form).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    _zero: u8,
    attrs: u8,
    offset_high: u16,
}

static_assertions::const_assert_eq!(size_of::<GateDescriptor>(), 8);

impl GateDescriptor {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            _zero: 0,
            attrs: 0, // not present
            offset_high: 0,
        }
    }

    /// Present 32-bit interrupt gate, DPL=0.
    pub fn interrupt_gate(handler: u32, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            _zero: 0,
            attrs: 0x8E,
            offset_high: (handler >> 16) as u16,
        }
    }

    pub fn present(&self) -> bool {
        self.attrs & 0x80 != 0
    }
}

/// 32-bit Task State Segment. The bootstrap only needs a valid stack-0
/// slot and the I/O bitmap ceiling; everything else is filled by hardware
/// task switches (which the kernel proper does not use).
#[repr(C, packed)]
pub struct Tss32 {
    pub link: u16,
    _link_pad: u16,
    pub esp0: u32,
    pub ss0: u16,
    _ss0_pad: u16,
    pub esp1: u32,
    pub ss1: u16,
    _ss1_pad: u16,
    pub esp2: u32,
    pub ss2: u16,
    _ss2_pad: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _es_pad: u16,
    pub cs: u16,
    _cs_pad: u16,
    pub ss: u16,
    _ss_pad: u16,
    pub ds: u16,
    _ds_pad: u16,
    pub fs: u16,
    _fs_pad: u16,
    pub gs: u16,
    _gs_pad: u16,
    pub ldt: u16,
    _ldt_pad: u16,
    pub trap: u16,
    pub iomap_base: u16,
}

static_assertions::const_assert_eq!(size_of::<Tss32>(), 104);

impl Tss32 {
    pub const fn zeroed() -> Self {
        // iomap_base past the segment limit = no I/O permission bitmap.
        Self {
            link: 0,
            _link_pad: 0,
            esp0: 0,
            ss0: 0,
            _ss0_pad: 0,
            esp1: 0,
            ss1: 0,
            _ss1_pad: 0,
            esp2: 0,
            ss2: 0,
            _ss2_pad: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _es_pad: 0,
            cs: 0,
            _cs_pad: 0,
            ss: 0,
            _ss_pad: 0,
            ds: 0,
            _ds_pad: 0,
            fs: 0,
            _fs_pad: 0,
            gs: 0,
            _gs_pad: 0,
            ldt: 0,
            _ldt_pad: 0,
            trap: 0,
            iomap_base: size_of::<Tss32>() as u16,
        }
    }
}

/// Pseudo-descriptor operand for LGDT/LIDT (32-bit form).
#[repr(C, packed)]
pub struct DtPointer {
    pub limit: u16,
    pub base: u32,
}

pub const GDT_ENTRIES: usize = 16;
pub const IDT_ENTRIES: usize = 256;
pub const LDT_ENTRIES: usize = 4;

// GDT slot layout. Slots 7..=9 are handed to the VCPI host during
// interface negotiation.
pub const SLOT_NULL: usize = 0;
pub const SLOT_CODE32: usize = 1;
pub const SLOT_DATA32: usize = 2;
pub const SLOT_CODE16: usize = 3;
pub const SLOT_DATA16: usize = 4;
pub const SLOT_LDT: usize = 5;
pub const SLOT_TSS: usize = 6;
pub const SLOT_VCPI_FIRST: usize = 7;

pub const KERNEL_CS: u16 = (SLOT_CODE32 * 8) as u16;
pub const KERNEL_DS: u16 = (SLOT_DATA32 * 8) as u16;
pub const CODE16_SEL: u16 = (SLOT_CODE16 * 8) as u16;
pub const DATA16_SEL: u16 = (SLOT_DATA16 * 8) as u16;
pub const LDT_SEL: u16 = (SLOT_LDT * 8) as u16;
pub const TSS_SEL: u16 = (SLOT_TSS * 8) as u16;
pub const VCPI_CODE_SEL: u16 = (SLOT_VCPI_FIRST * 8) as u16;

/// Descriptor tables for one logical CPU.
#[repr(C, align(16))]
pub struct CpuTables {
    gdt: [Descriptor; GDT_ENTRIES],
    idt: [GateDescriptor; IDT_ENTRIES],
    ldt: [Descriptor; LDT_ENTRIES],
    tss: Tss32,
    cpu_id: u32,
    /// Bumped by every `load`; lets callers (and tests) assert the tables
    /// were re-loaded after a linear-offset change.
    load_generation: u32,
}

impl CpuTables {
    pub const fn new(cpu_id: u32) -> Self {
        Self {
            gdt: [Descriptor::null(); GDT_ENTRIES],
            idt: [GateDescriptor::missing(); IDT_ENTRIES],
            ldt: [Descriptor::null(); LDT_ENTRIES],
            tss: Tss32::zeroed(),
            cpu_id,
            load_generation: 0,
        }
    }

    /// Build the default descriptor set: flat 32-bit code/data, 16-bit
    /// real-mode-compatible code/data, and the LDT/TSS slots.
    pub fn init(&mut self) {
        self.fill(SLOT_CODE32, 0, 0xFFFF_FFFF, 0x9A, SizeFlag::Bits32);
        self.fill(SLOT_DATA32, 0, 0xFFFF_FFFF, 0x92, SizeFlag::Bits32);
        self.fill(SLOT_CODE16, 0, 0xFFFF, 0x9A, SizeFlag::Bits16);
        self.fill(SLOT_DATA16, 0, 0xFFFF, 0x92, SizeFlag::Bits16);
        self.refresh_system_slots();
        self.tss.ss0 = KERNEL_DS;
        self.tss.iomap_base = size_of::<Tss32>() as u16;
    }

    /// Raw descriptor write. No validation; correctness is the caller's
    /// problem and shows up only as later faults.
    pub fn fill(&mut self, slot: usize, base: u32, limit: u32, access: u8, size: SizeFlag) {
        self.gdt[slot] = Descriptor::encode(base, limit, access, size);
    }

    /// Install a descriptor the host handed us verbatim.
    pub fn install_raw(&mut self, slot: usize, raw: u64) {
        self.gdt[slot] = Descriptor(raw);
    }

    pub fn descriptor(&self, slot: usize) -> Descriptor {
        self.gdt[slot]
    }

    pub fn fill_gate(&mut self, vector: usize, handler: u32, selector: u16) {
        self.idt[vector] = GateDescriptor::interrupt_gate(handler, selector);
    }

    pub fn gate_present(&self, vector: usize) -> bool {
        self.idt[vector].present()
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub fn tss_mut(&mut self) -> &mut Tss32 {
        &mut self.tss
    }

    /// Toggle the TSS descriptor busy bit (type 9 ↔ type B). The only
    /// post-construction descriptor mutation; LTR refuses a busy TSS.
    pub fn set_tss_busy(&mut self, busy: bool) {
        let d = self.gdt[SLOT_TSS].0;
        self.gdt[SLOT_TSS] = Descriptor(if busy {
            d | (0x2 << 40)
        } else {
            d & !(0x2 << 40)
        });
    }

    pub fn gdt_linear(&self) -> u32 {
        self.gdt.as_ptr() as usize as u32
    }

    pub fn idt_linear(&self) -> u32 {
        self.idt.as_ptr() as usize as u32
    }

    /// Rebuild the LDT/TSS descriptors from the tables' current linear
    /// addresses. Part of `load`, split out so `init` can pre-fill them.
    fn refresh_system_slots(&mut self) {
        let ldt_base = self.ldt.as_ptr() as usize as u32;
        let ldt_limit = (size_of::<[Descriptor; LDT_ENTRIES]>() - 1) as u32;
        self.fill(SLOT_LDT, ldt_base, ldt_limit, 0x82, SizeFlag::Bits16);

        let tss_base = &self.tss as *const Tss32 as usize as u32;
        let tss_limit = (size_of::<Tss32>() - 1) as u32;
        self.fill(SLOT_TSS, tss_base, tss_limit, 0x89, SizeFlag::Bits16);
    }

    /// Selector/pointer set the transition trampolines need.
    pub fn switch_frame(&self) -> SwitchFrame {
        SwitchFrame {
            gdt_limit: (size_of::<[Descriptor; GDT_ENTRIES]>() - 1) as u16,
            gdt_base: self.gdt_linear(),
            idt_limit: (size_of::<[GateDescriptor; IDT_ENTRIES]>() - 1) as u16,
            idt_base: self.idt_linear(),
            code_sel: KERNEL_CS,
            data_sel: KERNEL_DS,
            code16_sel: CODE16_SEL,
            data16_sel: DATA16_SEL,
            tss_sel: TSS_SEL,
            ldt_sel: LDT_SEL,
        }
    }

    pub fn load_generation(&self) -> u32 {
        self.load_generation
    }

    /// Load GDT/IDT/TR/LDTR from the tables' current linear addresses and
    /// reload every segment register - some processors skip segment
    /// reloads that look like no-ops, so the reload is unconditional.
    ///
    /// Must be re-invoked after any change to the physical-to-linear
    /// offset. No error signaling: a malformed table faults later.
    pub fn load(&mut self) {
        self.refresh_system_slots();
        // LTR demands a non-busy TSS descriptor.
        self.set_tss_busy(false);
        self.load_generation = self.load_generation.wrapping_add(1);

        #[cfg(target_os = "none")]
        unsafe {
            let gdt_ptr = DtPointer {
                limit: (size_of::<[Descriptor; GDT_ENTRIES]>() - 1) as u16,
                base: self.gdt_linear(),
            };
            let idt_ptr = DtPointer {
                limit: (size_of::<[GateDescriptor; IDT_ENTRIES]>() - 1) as u16,
                base: self.idt_linear(),
            };
            core::arch::asm!(
                "lgdt [{gdt}]",
                "lidt [{idt}]",
                "lldt {ldt:x}",
                "ltr {tss:x}",
                // Far jump to reload CS, then refresh the data segments.
                "push {cs}",
                "lea {tmp}, [2f]",
                "push {tmp}",
                "retf",
                "2:",
                "mov ds, {ds:x}",
                "mov es, {ds:x}",
                "mov fs, {ds:x}",
                "mov gs, {ds:x}",
                "mov ss, {ds:x}",
                gdt = in(reg) &gdt_ptr,
                idt = in(reg) &idt_ptr,
                ldt = in(reg) LDT_SEL,
                tss = in(reg) TSS_SEL,
                cs = in(reg) KERNEL_CS as u32,
                ds = in(reg) KERNEL_DS,
                tmp = lateout(reg) _,
                options(preserves_flags),
            );
        }
    }
}

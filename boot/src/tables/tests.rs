use super::*;

#[test]
fn descriptor_round_trip_byte_granular() {
    let d = Descriptor::encode(0x0012_3456, 0xFFFF, 0x9A, SizeFlag::Bits16);
    assert_eq!(d.base(), 0x0012_3456);
    assert_eq!(d.limit(), 0xFFFF);
    assert_eq!(d.access(), 0x9A);
    assert_eq!(d.size(), SizeFlag::Bits16);
    assert!(!d.granular());
    assert!(d.present());
    assert!(d.executable());
}

#[test]
fn descriptor_round_trip_page_granular() {
    // Limits of 1 MiB and above flip to page granularity; the decoded
    // limit is rounded up to the next page boundary minus one.
    let d = Descriptor::encode(0, 0xFFFF_FFFF, 0x92, SizeFlag::Bits32);
    assert_eq!(d.base(), 0);
    assert_eq!(d.limit(), 0xFFFF_FFFF);
    assert!(d.granular());
    assert_eq!(d.size(), SizeFlag::Bits32);
    assert!(!d.executable());

    let d = Descriptor::encode(0x00C0_0000, 0x0010_0000, 0x92, SizeFlag::Bits32);
    assert!(d.granular());
    assert_eq!(d.limit(), 0x0010_0FFF);
}

#[test]
fn descriptor_base_spans_all_fields() {
    // Base bits live in three separate descriptor fields.
    let d = Descriptor::encode(0xDEAD_BEEF, 0x100, 0x92, SizeFlag::Bits32);
    assert_eq!(d.base(), 0xDEAD_BEEF);
}

#[test]
fn null_descriptor_is_absent() {
    let d = Descriptor::null();
    assert!(!d.present());
    assert!(!d.executable());
}

#[test]
fn init_builds_flat_and_real_compatible_slots() {
    let mut tables = CpuTables::new(0);
    tables.init();

    let code = tables.descriptor(SLOT_CODE32);
    assert!(code.present() && code.executable());
    assert_eq!(code.limit(), 0xFFFF_FFFF);
    assert_eq!(code.size(), SizeFlag::Bits32);

    let code16 = tables.descriptor(SLOT_CODE16);
    assert_eq!(code16.limit(), 0xFFFF);
    assert_eq!(code16.size(), SizeFlag::Bits16);

    let data16 = tables.descriptor(SLOT_DATA16);
    assert_eq!(data16.limit(), 0xFFFF);
    assert!(!data16.executable());

    assert!(!tables.descriptor(SLOT_NULL).present());
}

#[test]
fn switch_frame_reflects_selectors_and_pointers() {
    let mut tables = CpuTables::new(2);
    tables.init();
    let frame = tables.switch_frame();
    assert_eq!(frame.code_sel, KERNEL_CS);
    assert_eq!(frame.data_sel, KERNEL_DS);
    assert_eq!(frame.code16_sel, CODE16_SEL);
    assert_eq!(frame.data16_sel, DATA16_SEL);
    assert_eq!(frame.tss_sel, TSS_SEL);
    assert_eq!(frame.ldt_sel, LDT_SEL);
    assert_eq!(frame.gdt_base, tables.gdt_linear());
    assert_eq!(frame.idt_base, tables.idt_linear());
    assert_eq!(frame.gdt_limit, (GDT_ENTRIES * 8 - 1) as u16);
    assert_eq!(frame.idt_limit, (IDT_ENTRIES * 8 - 1) as u16);
}

#[test]
fn tss_busy_bit_toggles() {
    let mut tables = CpuTables::new(0);
    tables.init();
    // Available 32-bit TSS is type 9; busy is type B.
    assert_eq!(tables.descriptor(SLOT_TSS).access() & 0x0F, 0x9);
    tables.set_tss_busy(true);
    assert_eq!(tables.descriptor(SLOT_TSS).access() & 0x0F, 0xB);
    tables.set_tss_busy(false);
    assert_eq!(tables.descriptor(SLOT_TSS).access() & 0x0F, 0x9);
}

#[test]
fn load_clears_busy_and_bumps_generation() {
    let mut tables = CpuTables::new(0);
    tables.init();
    tables.set_tss_busy(true);
    let gen = tables.load_generation();
    tables.load();
    assert_eq!(tables.load_generation(), gen + 1);
    assert_eq!(tables.descriptor(SLOT_TSS).access() & 0x0F, 0x9);
}

#[test]
fn install_raw_round_trips_host_descriptors() {
    let mut tables = CpuTables::new(0);
    tables.init();
    let host = Descriptor::encode(0x000C_0000, 0xFFFF, 0x9A, SizeFlag::Bits32);
    tables.install_raw(SLOT_VCPI_FIRST, host.0);
    assert_eq!(tables.descriptor(SLOT_VCPI_FIRST), host);
}

#[test]
fn gates_start_missing_and_fill() {
    let mut tables = CpuTables::new(0);
    tables.init();
    assert!(!tables.gate_present(0x20));
    tables.fill_gate(0x20, 0x0010_2030, KERNEL_CS);
    assert!(tables.gate_present(0x20));
    assert!(!tables.gate_present(0x21));
}

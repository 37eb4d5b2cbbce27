use super::*;
use crate::host::mock::{Event, MockHost};
use crate::host::{CpuMode, RealPtr, SwitchDirection, FLAG_IF};
use crate::mode::bridge;
use crate::tables::{CpuTables, LDT_SEL, TSS_SEL};

fn fast_gate_switch() -> ModeSwitch {
    let mut tables = CpuTables::new(0);
    tables.init();
    ModeSwitch::new(tables.switch_frame(), A20Method::FastGate)
}

#[test]
fn raw_round_trip_restores_machine_state() {
    let mut host = MockHost::new();
    let mut switch = fast_gate_switch();
    let caller_flags = host.eflags();
    assert!(!host.a20_enabled());

    switch.to_pmode(&mut host).unwrap();
    assert_eq!(switch.mode(), CpuMode::Pmode);
    assert_eq!(host.mode(), CpuMode::Pmode);
    assert!(host.a20_enabled());
    assert_eq!(host.eflags() & FLAG_IF, 0);

    switch.to_real(&mut host).unwrap();
    assert_eq!(switch.mode(), CpuMode::Real);
    assert_eq!(host.mode(), CpuMode::Real);
    assert_eq!(host.eflags(), caller_flags);
    assert!(!host.a20_enabled(), "A20 not restored to its saved state");

    let events = host.events();
    let enter = events
        .iter()
        .position(|e| *e == Event::RawEnterPmode)
        .unwrap();
    let leave = events
        .iter()
        .position(|e| *e == Event::RawLeavePmode)
        .unwrap();
    let idt = events
        .iter()
        .position(|e| *e == Event::RealIdtLoaded)
        .unwrap();
    assert!(enter < leave && leave < idt);
    assert!(events.contains(&Event::Clts));
}

#[test]
fn repeated_round_trips_are_stable() {
    let mut host = MockHost::new();
    let mut switch = fast_gate_switch();
    let caller_flags = host.eflags();

    for _ in 0..16 {
        switch.to_pmode(&mut host).unwrap();
        switch.to_real(&mut host).unwrap();
    }
    assert_eq!(switch.mode(), CpuMode::Real);
    assert_eq!(host.eflags(), caller_flags);
    assert!(!host.a20_enabled());
    assert!(!host.reset_pulsed, "fast gate must never pulse reset");
}

#[test]
fn direction_flag_normalized_on_entry() {
    let mut host = MockHost::new();
    let mut switch = fast_gate_switch();
    host.set_eflags(host.eflags() | crate::host::FLAG_DF);
    switch.to_pmode(&mut host).unwrap();
    assert_eq!(host.eflags() & crate::host::FLAG_DF, 0);
}

#[test]
fn a20_untouched_when_already_enabled() {
    let mut host = MockHost::new();
    host.set_a20(true);
    let mut switch = fast_gate_switch();
    switch.to_pmode(&mut host).unwrap();
    switch.to_real(&mut host).unwrap();
    assert!(host.a20_enabled());
    assert!(!host.events().contains(&Event::A20Changed(false)));
}

#[test]
fn keyboard_controller_a20_path() {
    let mut host = MockHost::new();
    let mut tables = CpuTables::new(0);
    tables.init();
    let mut switch = ModeSwitch::new(tables.switch_frame(), A20Method::Keyboard);
    switch.to_pmode(&mut host).unwrap();
    assert!(host.a20_enabled());
}

#[test]
fn wedged_keyboard_controller_times_out() {
    let mut host = MockHost::new();
    host.kbc_busy_polls = u32::MAX;
    let mut tables = CpuTables::new(0);
    tables.init();
    let mut switch = ModeSwitch::new(tables.switch_frame(), A20Method::Keyboard);
    match switch.to_pmode(&mut host) {
        Err(BootError::Timeout(_)) => {}
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[test]
fn xms_manager_drives_a20() {
    let mut host = MockHost::new();
    host.xms_present = true;
    let mut tables = CpuTables::new(0);
    tables.init();
    let entry = RealPtr::new(0x9000, 0x0100);
    let mut switch = ModeSwitch::new(tables.switch_frame(), A20Method::Xms(entry));

    switch.to_pmode(&mut host).unwrap();
    assert!(host.a20_enabled());
    switch.to_real(&mut host).unwrap();
    assert!(!host.a20_enabled());
    assert!(host.events().contains(&Event::XmsCall(0x05)));
    assert!(host.events().contains(&Event::XmsCall(0x06)));
}

#[test]
fn vcpi_backend_round_trip() {
    let mut host = MockHost::with_vcpi();
    let mut tables = CpuTables::new(0);
    tables.init();
    let frame = tables.switch_frame();
    let mut switch = ModeSwitch::new(frame, A20Method::FastGate);

    let session = crate::vcpi::VcpiSession::new(0x7E000, 0x7F000, 0x7D000);
    session.build_page_dir(&mut host);
    session.write_switch_data(
        &mut host,
        frame.gdt_limit,
        frame.gdt_base,
        frame.idt_limit,
        frame.idt_base,
        LDT_SEL,
        TSS_SEL,
    );
    switch.upgrade_to_vcpi(session);
    assert_eq!(switch.backend().kind(), BackendKind::Vcpi);

    // The mediated path has to be as repeatable as the raw one.
    let caller_flags = host.eflags();
    for _ in 0..16 {
        switch.to_pmode(&mut host).unwrap();
        switch.to_real(&mut host).unwrap();
    }
    assert_eq!(switch.mode(), CpuMode::Real);
    assert_eq!(host.mode(), CpuMode::Real);
    assert_eq!(host.eflags(), caller_flags);
    assert!(!host.a20_enabled(), "A20 not restored to its saved state");

    let events = host.events();
    assert!(events.contains(&Event::VcpiSwitch(SwitchDirection::ToPmode)));
    assert!(events.contains(&Event::VcpiSwitch(SwitchDirection::ToReal)));
    assert!(!events.contains(&Event::RawEnterPmode));
}

#[test]
fn bridge_is_direct_in_real_mode() {
    let mut host = MockHost::new();
    let mut switch = fast_gate_switch();
    let mut regs = crate::host::RegisterBlock::default();
    bridge::real_int(&mut switch, &mut host, 0x12, &mut regs).unwrap();
    assert_eq!(regs.eax & 0xFFFF, 640);
    assert!(!host.events().contains(&Event::RawEnterPmode));
}

#[test]
fn bridge_round_trips_from_pmode() {
    let mut host = MockHost::new();
    let mut switch = fast_gate_switch();
    switch.to_pmode(&mut host).unwrap();
    host.clear_events();

    let mut regs = crate::host::RegisterBlock::default();
    bridge::real_int(&mut switch, &mut host, 0x12, &mut regs).unwrap();
    assert_eq!(regs.eax & 0xFFFF, 640);
    assert_eq!(switch.mode(), CpuMode::Pmode);
    assert_eq!(host.mode(), CpuMode::Pmode);

    let events = host.events();
    let leave = events
        .iter()
        .position(|e| *e == Event::RawLeavePmode)
        .unwrap();
    let int = events
        .iter()
        .position(|e| *e == Event::RealInt(0x12))
        .unwrap();
    let enter = events
        .iter()
        .position(|e| *e == Event::RawEnterPmode)
        .unwrap();
    assert!(leave < int && int < enter);
}

use super::irq::find_free_vector_run;
use super::*;
use crate::a20::A20Method;
use crate::error::BootError;
use crate::host::mock::MockHost;
use crate::host::{CpuMode, HostBus};
use crate::mem::pool::PhysMemPool;
use crate::mem::providers::{DosProvider, MemoryProvider, VcpiMemProvider};
use crate::mode::ModeSwitch;
use crate::tables::{CpuTables, SLOT_VCPI_FIRST};

const PARKED_VECTOR: u32 = 0xF000_FF53;

fn probed_dos(host: &mut MockHost) -> DosProvider {
    let mut dos = DosProvider::new(true);
    dos.probe(host).unwrap();
    dos
}

fn boot_tables() -> CpuTables {
    let mut tables = CpuTables::new(0);
    tables.init();
    tables
}

#[test]
fn prepare_negotiates_a_full_session() {
    let mut host = MockHost::with_vcpi();
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();

    let session = neg
        .prepare(&mut host, &mut dos, &mut tables)
        .unwrap()
        .expect("host present but no session");

    assert_eq!(neg.state(), VcpiState::IrqWindowNegotiated);
    assert_eq!(neg.version(), Some((1, 0)));
    assert_eq!(session.pmode_entry, host.vcpi_pmode_entry);
    assert_eq!(session.first_free_pte, 256);

    // The host's descriptors landed in the reserved GDT slots.
    let code = tables.descriptor(SLOT_VCPI_FIRST);
    assert!(code.present() && code.executable());
    assert!(tables.descriptor(SLOT_VCPI_FIRST + 1).present());

    // Master base 0x08 collides with the CPU exceptions, so the window
    // was relocated and the host informed.
    assert!(session.pic_relocated);
    assert_eq!(session.irq_window.master_base, 0xF8);
    assert_eq!(host.pic_bases(), (0xF8, 0x70));
    assert_eq!(host.informed_window, Some((0xF8, 0x70)));

    // Saved vectors are the parked originals; the live hardware vectors
    // were mirrored into the new window.
    for i in 0..8u8 {
        assert_eq!(session.saved_irq_vectors[i as usize], PARKED_VECTOR);
        assert_eq!(host.ivt_entry(0xF8 + i), host.ivt_entry(8 + i));
    }
}

#[test]
fn no_emm_driver_means_no_session() {
    let mut host = MockHost::new();
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(neg.prepare(&mut host, &mut dos, &mut tables).unwrap().is_none());
    assert_eq!(neg.state(), VcpiState::Unprobed);
    assert_eq!(neg.version(), None);
}

#[test]
fn emm_without_vcpi_releases_the_pinned_ems_page() {
    let mut host = MockHost::new();
    host.emm_present = true;
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(neg.prepare(&mut host, &mut dos, &mut tables).unwrap().is_none());
    assert!(host.ems_live_handles.is_empty(), "EMS page leaked");
}

#[test]
fn hostile_code_descriptor_is_rejected() {
    let mut host = MockHost::with_vcpi();
    host.vcpi_bad_descriptor = true;
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    match neg.prepare(&mut host, &mut dos, &mut tables) {
        Err(BootError::ProtocolViolation(_)) => {}
        other => panic!("expected protocol violation, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn short_identity_map_is_rejected() {
    let mut host = MockHost::with_vcpi();
    host.vcpi_short_map = true;
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(matches!(
        neg.prepare(&mut host, &mut dos, &mut tables),
        Err(BootError::ProtocolViolation(_))
    ));
}

#[test]
fn non_identity_pte_is_rejected() {
    let mut host = MockHost::with_vcpi();
    host.vcpi_bad_pte = true;
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(matches!(
        neg.prepare(&mut host, &mut dos, &mut tables),
        Err(BootError::ProtocolViolation(_))
    ));
}

#[test]
fn non_identity_rom_window_pte_is_rejected() {
    // The ROM/video window may be read-only, but it still has to be an
    // identity mapping.
    let mut host = MockHost::with_vcpi();
    host.vcpi_bad_rom_pte = true;
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(matches!(
        neg.prepare(&mut host, &mut dos, &mut tables),
        Err(BootError::ProtocolViolation(_))
    ));
}

#[test]
fn sane_host_window_needs_no_relocation() {
    let mut host = MockHost::with_vcpi();
    host.vcpi_master_base = 0x20;
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    let session = neg
        .prepare(&mut host, &mut dos, &mut tables)
        .unwrap()
        .unwrap();
    assert!(!session.pic_relocated);
    assert_eq!(session.irq_window.master_base, 0x20);
    assert_eq!(host.pic_bases(), (0x08, 0x70));
    assert_eq!(host.informed_window, None);
}

#[test]
fn no_free_vector_window_is_resource_exhaustion() {
    let mut host = MockHost::with_vcpi();
    host.scatter_high_vectors();
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(matches!(
        neg.prepare(&mut host, &mut dos, &mut tables),
        Err(BootError::ResourceExhausted(_))
    ));
}

#[test]
fn rejected_relocation_is_a_protocol_violation() {
    let mut host = MockHost::with_vcpi();
    host.vcpi_reject_window = true;
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(matches!(
        neg.prepare(&mut host, &mut dos, &mut tables),
        Err(BootError::ProtocolViolation(_))
    ));
}

#[test]
fn exhausted_low_memory_fails_after_detection() {
    let mut host = MockHost::with_vcpi();
    host.dos_largest_paras = 0x10; // 256 bytes - no room for page tables
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    assert!(matches!(
        neg.prepare(&mut host, &mut dos, &mut tables),
        Err(BootError::ResourceExhausted(_))
    ));
    // Detection already succeeded; the sequencer uses this to tell a
    // pre-commit failure (fall back to Raw) from a post-commit one.
    assert_eq!(neg.state(), VcpiState::Detected);
}

#[test]
fn free_vector_scan_finds_the_parked_run() {
    let host = MockHost::new();
    assert_eq!(find_free_vector_run(&host), Some(0xF8));
}

#[test]
fn activation_and_shutdown_round_trip() {
    let mut host = MockHost::with_vcpi();
    let mut dos = probed_dos(&mut host);
    let mut tables = boot_tables();
    let mut neg = VcpiNegotiator::new();
    let mut pool = PhysMemPool::new();
    let mut vcpi_mem = VcpiMemProvider::new();
    vcpi_mem.probe(&mut host).unwrap();

    let session = neg
        .prepare(&mut host, &mut dos, &mut tables)
        .unwrap()
        .unwrap();
    let mut switch = ModeSwitch::new(tables.switch_frame(), A20Method::FastGate);
    switch.upgrade_to_vcpi(session);

    switch.to_pmode(&mut host).unwrap();
    neg.finish_pmode(
        &mut host,
        &mut switch,
        &mut tables,
        &mut pool,
        &mut dos,
        vcpi_mem.max_phys(),
    )
    .unwrap();
    vcpi_mem.collect(&mut host, &mut switch, &mut pool).unwrap();
    neg.activate(&mut host, &mut switch).unwrap();

    assert_eq!(neg.state(), VcpiState::Active);
    assert_eq!(host.mode(), CpuMode::Pmode);
    assert!(pool.total_bytes() > 0);

    // Shutdown from pmode: PIC and vectors back exactly as found, EMS
    // page returned.
    neg.shutdown(&mut host, &mut switch).unwrap();
    assert_eq!(neg.state(), VcpiState::ShutDown);
    assert_eq!(host.pic_bases(), (0x08, 0x70));
    assert_eq!(host.informed_window, Some((0x08, 0x70)));
    for i in 0..8u8 {
        assert_eq!(host.ivt_entry(0xF8 + i), PARKED_VECTOR);
    }
    assert!(host.ems_live_handles.is_empty());

    // Idempotent: a second shutdown does nothing.
    let events_before = host.events().len();
    neg.shutdown(&mut host, &mut switch).unwrap();
    assert_eq!(host.events().len(), events_before);
}

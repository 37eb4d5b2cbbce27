use super::pool::PhysMemPool;
use super::providers::*;
use super::range::{classify, split_at_boundaries, MemoryRange, RangeFlags, ONE_MB, SIXTEEN_MB};
use crate::a20::A20Method;
use crate::host::mock::MockHost;
use crate::mode::ModeSwitch;
use crate::tables::CpuTables;

fn real_mode_switch() -> ModeSwitch {
    let mut tables = CpuTables::new(0);
    tables.init();
    ModeSwitch::new(tables.switch_frame(), A20Method::FastGate)
}

// ---- classification ----

#[test]
fn classify_applies_both_ceilings() {
    assert_eq!(
        classify(0, ONE_MB),
        RangeFlags::BELOW_1M | RangeFlags::BELOW_16M
    );
    assert_eq!(classify(ONE_MB, SIXTEEN_MB - ONE_MB), RangeFlags::BELOW_16M);
    assert_eq!(classify(SIXTEEN_MB, 0x100_0000), RangeFlags::empty());
}

#[test]
fn split_covers_exactly_once() {
    let mut pieces = heapless::Vec::<(u64, u64), 4>::new();
    split_at_boundaries(0x8_0000, 0x2000_0000, |b, s| {
        pieces.push((b, s)).unwrap();
    });
    assert_eq!(
        pieces.as_slice(),
        &[
            (0x8_0000, ONE_MB - 0x8_0000),
            (ONE_MB, SIXTEEN_MB - ONE_MB),
            (SIXTEEN_MB, 0x8_0000 + 0x2000_0000 - SIXTEEN_MB),
        ]
    );
}

// ---- pool ----

#[test]
fn add_is_commutative_and_idempotent() {
    let ranges: [(u64, u64); 3] = [
        (0, ONE_MB),
        (ONE_MB, SIXTEEN_MB - ONE_MB),
        (SIXTEEN_MB, 0x300_0000),
    ];
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    let mut reference: Option<(u64, u64, u64, u64)> = None;
    for order in orders {
        let mut pool = PhysMemPool::new();
        for i in order {
            pool.add(ranges[i].0, ranges[i].1).unwrap();
        }
        // Adding everything a second time must change nothing.
        for i in order {
            pool.add(ranges[i].0, ranges[i].1).unwrap();
        }
        let snapshot = (
            pool.total_bytes(),
            pool.bytes_with_flags(RangeFlags::BELOW_1M | RangeFlags::BELOW_16M),
            pool.bytes_with_flags(RangeFlags::BELOW_16M),
            pool.bytes_with_flags(RangeFlags::empty()),
        );
        match reference {
            None => reference = Some(snapshot),
            Some(r) => assert_eq!(snapshot, r, "order {:?} diverged", order),
        }
    }

    let (total, below_1m, below_16m, unflagged) = reference.unwrap();
    assert_eq!(total, SIXTEEN_MB + 0x300_0000);
    assert_eq!(below_1m, ONE_MB);
    assert_eq!(below_16m, SIXTEEN_MB - ONE_MB);
    assert_eq!(unflagged, 0x300_0000);
}

#[test]
fn boundary_crossing_range_is_split() {
    let mut pool = PhysMemPool::new();
    pool.add(0x8_0000, 0x2000_0000).unwrap();
    assert_eq!(pool.region_count(), 3);
    assert_eq!(pool.total_bytes(), 0x2000_0000);
    assert_eq!(pool.max_address(), 0x8_0000 + 0x2000_0000);
}

#[test]
fn touching_regions_coalesce() {
    let mut pool = PhysMemPool::new();
    pool.add(ONE_MB, 0x1000).unwrap();
    pool.add(ONE_MB + 0x1000, 0x1000).unwrap();
    pool.add(ONE_MB + 0x3000, 0x1000).unwrap();
    assert_eq!(pool.region_count(), 2);
    pool.add(ONE_MB + 0x2000, 0x1000).unwrap();
    assert_eq!(pool.region_count(), 1);
    assert_eq!(pool.total_bytes(), 0x4000);
}

#[test]
fn classes_never_coalesce_across_a_boundary() {
    // [0, 1M) and [1M, 16M) touch at the 1 MiB line but belong to
    // different classes; merging them would wreck the per-class totals.
    let mut pool = PhysMemPool::new();
    pool.add(0, ONE_MB).unwrap();
    pool.add(ONE_MB, SIXTEEN_MB - ONE_MB).unwrap();
    assert_eq!(pool.region_count(), 2);
    assert_eq!(
        pool.bytes_with_flags(RangeFlags::BELOW_1M | RangeFlags::BELOW_16M),
        ONE_MB
    );
    assert_eq!(
        pool.bytes_with_flags(RangeFlags::BELOW_16M),
        SIXTEEN_MB - ONE_MB
    );
}

#[test]
fn overlapping_merge_keeps_highest_priority() {
    let mut pool = PhysMemPool::new();
    pool.add_with_priority(ONE_MB, 0x4000, 2).unwrap();
    pool.add_with_priority(ONE_MB + 0x2000, 0x4000, 5).unwrap();
    assert_eq!(pool.region_count(), 1);
    assert_eq!(pool.regions()[0].priority, 5);
    assert_eq!(pool.total_bytes(), 0x6000);
}

#[test]
fn alloc_takes_from_the_top() {
    let mut pool = PhysMemPool::new();
    pool.add(0x2_0000, 0x6_0000).unwrap(); // low
    pool.add(ONE_MB, 0x10_0000).unwrap(); // high
    let page = pool.alloc_pages(1).unwrap();
    assert_eq!(page, ONE_MB + 0x10_0000 - 0x1000);
    assert_eq!(pool.total_bytes(), 0x6_0000 + 0x10_0000 - 0x1000);

    // Low memory is spent only when nothing higher fits.
    let big = pool.alloc_pages(255).unwrap();
    assert!(big >= ONE_MB);
}

#[test]
fn alloc_exhaustion_is_an_error() {
    let mut pool = PhysMemPool::new();
    pool.add(0x2_0000, 0x1000).unwrap();
    pool.alloc_pages(1).unwrap();
    assert!(pool.alloc_pages(1).is_err());
}

// ---- providers ----

#[test]
fn dos_provider_honors_the_dos_arena() {
    let mut host = MockHost::new();
    let mut dos = DosProvider::new(true);
    let r = dos.probe(&mut host).unwrap();
    assert_eq!(r.base, (host.dos_alloc_segment as u64) << 4);
    assert_eq!(r.size, (host.dos_largest_paras as u64) << 4);
    assert_eq!(r.flags, RangeFlags::BELOW_1M | RangeFlags::BELOW_16M);
}

#[test]
fn dos_provider_takes_whole_conventional_without_dos() {
    let mut host = MockHost::new();
    let mut dos = DosProvider::new(false);
    let r = dos.probe(&mut host).unwrap();
    assert_eq!(r.base, 0);
    assert_eq!(r.size, 640 * 1024);
}

#[test]
fn reserve_low_carves_aligned_from_the_top() {
    let mut host = MockHost::new();
    let mut dos = DosProvider::new(true);
    let r = dos.probe(&mut host).unwrap();
    let end = r.end();

    let pages = dos.reserve_low(0x2000, 0x1000).unwrap();
    assert_eq!(pages % 0x1000, 0);
    assert!((pages as u64) < end && pages as u64 >= r.base);
    let scratch = dos.reserve_low(64, 16).unwrap();
    assert_eq!(scratch % 16, 0);
    assert!((scratch as u64) < pages as u64);

    // The stash shrank by what was carved.
    let left = dos.stashed().unwrap();
    assert_eq!(left.end(), scratch as u64);
}

#[test]
fn dos_collect_is_idempotent() {
    let mut host = MockHost::new();
    let mut switch = real_mode_switch();
    let mut pool = PhysMemPool::new();
    let mut dos = DosProvider::new(true);
    dos.probe(&mut host).unwrap();
    dos.collect(&mut host, &mut switch, &mut pool).unwrap();
    let total = pool.total_bytes();
    dos.collect(&mut host, &mut switch, &mut pool).unwrap();
    assert_eq!(pool.total_bytes(), total);
}

#[test]
fn xms_provider_locks_largest_block() {
    let mut host = MockHost::new();
    host.xms_present = true;
    let mut xms = XmsProvider::new();
    let r = xms.probe(&mut host).unwrap();
    assert_eq!(r.base, host.xms_lock_base as u64);
    assert_eq!(r.size, host.xms_largest_kb as u64 * 1024);
    assert!(xms.entry().is_some());
    assert_eq!(host.xms_live_handles.len(), 1);
}

#[test]
fn xms_release_frees_the_handle() {
    let mut host = MockHost::new();
    host.xms_present = true;
    let mut xms = XmsProvider::new();
    xms.probe(&mut host).unwrap();
    xms.release(&mut host);
    assert!(host.xms_live_handles.is_empty());
}

#[test]
fn xms_absent_is_not_an_error() {
    let mut host = MockHost::new();
    let mut xms = XmsProvider::new();
    assert!(xms.probe(&mut host).is_none());
    assert!(xms.entry().is_none());
}

#[test]
fn raw_bios_reports_both_extended_ranges() {
    let mut host = MockHost::new();
    host.e801_low_kb = 0x3C00; // 15 MiB, filling 1..16 MiB exactly
    host.e801_high_64k = 0x30; // 3 MiB above 16 MiB
    let mut bios = RawBiosProvider::new();
    let mut switch = real_mode_switch();
    let mut pool = PhysMemPool::new();
    bios.probe(&mut host).unwrap();
    bios.collect(&mut host, &mut switch, &mut pool).unwrap();
    assert_eq!(pool.bytes_with_flags(RangeFlags::BELOW_16M), 15 * ONE_MB);
    assert_eq!(pool.bytes_with_flags(RangeFlags::empty()), 3 * ONE_MB);
}

#[test]
fn raw_bios_falls_back_to_int88() {
    let mut host = MockHost::new();
    host.e801_supported = false;
    host.int88_kb = 0x0800; // 2 MiB
    let mut bios = RawBiosProvider::new();
    let r = bios.probe(&mut host).unwrap();
    assert_eq!(r.base, ONE_MB);
    assert_eq!(r.size, 2 * ONE_MB);
}

#[test]
fn vcpi_provider_harvests_scattered_pages() {
    let mut host = MockHost::with_vcpi();
    let mut vcpi = VcpiMemProvider::new();
    let mut switch = real_mode_switch();
    let mut pool = PhysMemPool::new();

    let advisory = vcpi.probe(&mut host).unwrap();
    assert_eq!(advisory.size, host.vcpi_free_pages.len() as u64 * 4096);
    assert!(vcpi.max_phys() > 0);

    vcpi.collect(&mut host, &mut switch, &mut pool).unwrap();
    // Contiguous host pages coalesce into one region.
    assert_eq!(pool.region_count(), 1);
    assert_eq!(pool.total_bytes(), advisory.size);
    assert!(host.vcpi_free_pages.is_empty());

    // Idempotent: nothing left to harvest, nothing double-counted.
    vcpi.collect(&mut host, &mut switch, &mut pool).unwrap();
    assert_eq!(pool.total_bytes(), advisory.size);
}

#[test]
fn dpmi_stub_detects_but_offers_nothing() {
    let mut host = MockHost::new();
    host.dpmi_present = true;
    let mut dpmi = DpmiStubProvider::new();
    assert!(dpmi.probe(&mut host).is_none());
    assert!(dpmi.detected());

    let mut host = MockHost::new();
    let mut dpmi = DpmiStubProvider::new();
    assert!(dpmi.probe(&mut host).is_none());
    assert!(!dpmi.detected());
}

/// Bootstrap sequencer - drives the whole cold-start:
/// probe → negotiate → first switch → collect → self-test.
///
/// Providers are probed in priority order (VCPI, then the DPMI stub,
/// then XMS, then the raw BIOS reports) and exactly one extended-memory
/// provider wins - they all describe the same physical RAM, and merging
/// two of them would double-count it. Conventional memory is probed
/// unconditionally.
use crate::a20::A20Method;
use crate::error::BootError;
use crate::host::{CpuMode, HostBus};
use crate::mem::pool::PhysMemPool;
use crate::mem::providers::{
    DosProvider, DpmiStubProvider, MemoryProvider, RawBiosProvider, VcpiMemProvider, XmsProvider,
};
use crate::mem::range::{RangeFlags, ONE_MB};
use crate::mode::{Backend, BackendKind, ModeSwitch};
use crate::tables::CpuTables;
use crate::vcpi::{IrqVectorWindow, VcpiNegotiator, VcpiState};

/// How control arrived at the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Started as a DOS executable; DOS services are live and its memory
    /// arena must be honored.
    Dos,
    /// Multiboot-style loader; BIOS only.
    Multiboot,
    /// Linux-style boot protocol; BIOS only.
    LinuxBoot,
}

impl Handoff {
    const fn dos_services(self) -> bool {
        matches!(self, Handoff::Dos)
    }
}

/// Which extended-memory provider won the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedSource {
    Vcpi,
    Xms,
    RawBios,
    None,
}

/// What the finished bootstrap hands to the kernel proper.
#[derive(Debug, Clone, Copy)]
pub struct BootReport {
    pub handoff: Handoff,
    pub backend: BackendKind,
    pub extended_source: ExtendedSource,
    pub vcpi_version: Option<(u8, u8)>,
    pub irq_window: Option<IrqVectorWindow>,
    pub dpmi_host_seen: bool,
    pub conventional_bytes: u64,
    pub total_bytes: u64,
    pub max_address: u64,
}

pub struct Bootstrap {
    handoff: Handoff,
    tables: CpuTables,
    pool: PhysMemPool,
    dos: DosProvider,
    xms: XmsProvider,
    vcpi_mem: VcpiMemProvider,
    raw_bios: RawBiosProvider,
    dpmi: DpmiStubProvider,
    negotiator: VcpiNegotiator,
    switch: Option<ModeSwitch>,
}

impl Bootstrap {
    pub const fn new(handoff: Handoff) -> Self {
        Self {
            handoff,
            tables: CpuTables::new(0),
            pool: PhysMemPool::new(),
            dos: DosProvider::new(handoff.dos_services()),
            xms: XmsProvider::new(),
            vcpi_mem: VcpiMemProvider::new(),
            raw_bios: RawBiosProvider::new(),
            dpmi: DpmiStubProvider::new(),
            negotiator: VcpiNegotiator::new(),
            switch: None,
        }
    }

    pub fn switch(&mut self) -> Option<&mut ModeSwitch> {
        self.switch.as_mut()
    }

    pub fn tables(&mut self) -> &mut CpuTables {
        &mut self.tables
    }

    pub fn pool(&self) -> &PhysMemPool {
        &self.pool
    }

    /// Keep the live boot image out of the pool. Needed on BIOS-only
    /// handoffs, where the whole conventional range is reported free;
    /// the DOS arena already excludes the running program.
    pub fn reserve_image(&mut self, base: u64, size: u64) {
        self.dos.exclude(base, size);
    }

    /// Run the whole sequence. On success the machine is in protected
    /// mode with every discovered byte pooled and the transition layer
    /// live for `RealCallBridge` users.
    pub fn run(&mut self, bus: &mut dyn HostBus) -> Result<BootReport, BootError> {
        self.tables.init();

        self.dos
            .probe(bus)
            .ok_or(BootError::ResourceExhausted("no conventional memory"))?;

        // VCPI negotiation first: when a V86 host runs the machine, the
        // raw backend cannot work at all, and claiming XMS memory under
        // such a host would fight it. A missing host falls through
        // quietly; a negotiation failure *before* resources are committed
        // (low DOS memory gone) falls back to Raw; anything later is
        // fatal.
        let session = match self.negotiator.prepare(bus, &mut self.dos, &mut self.tables) {
            Ok(s) => s,
            Err(BootError::ResourceExhausted(_)) if self.negotiator.state() == VcpiState::Detected => None,
            Err(e) => return Err(e),
        };

        let mut extended = ExtendedSource::None;
        if session.is_some() {
            if self.vcpi_mem.probe(bus).is_some() {
                extended = ExtendedSource::Vcpi;
            }
        } else {
            self.dpmi.probe(bus);
            if self.xms.probe(bus).is_some() {
                extended = ExtendedSource::Xms;
            } else if self.raw_bios.probe(bus).is_some() {
                extended = ExtendedSource::RawBios;
            }
        }

        // A resident XMS manager owns the A20 gate; driving the hardware
        // behind its back loses.
        let a20_method = match self.xms.entry() {
            Some(entry) => A20Method::Xms(entry),
            None => A20Method::FastGate,
        };

        let mut switch = ModeSwitch::new(self.tables.switch_frame(), a20_method);

        match session {
            Some(session) => {
                switch.upgrade_to_vcpi(session);
                switch.to_pmode(bus)?;

                let map_limit = self.vcpi_mem.max_phys().max(ONE_MB);
                self.negotiator.finish_pmode(
                    bus,
                    &mut switch,
                    &mut self.tables,
                    &mut self.pool,
                    &mut self.dos,
                    map_limit,
                )?;
                self.vcpi_mem.collect(bus, &mut switch, &mut self.pool)?;
                self.negotiator.activate(bus, &mut switch)?;
            }
            None => {
                switch.to_pmode(bus)?;
                self.tables.load();
                self.dos.collect(bus, &mut switch, &mut self.pool)?;
                match extended {
                    ExtendedSource::Xms => {
                        self.xms.collect(bus, &mut switch, &mut self.pool)?
                    }
                    ExtendedSource::RawBios => {
                        self.raw_bios.collect(bus, &mut switch, &mut self.pool)?
                    }
                    _ => {}
                }
            }
        }

        debug_assert_eq!(bus.mode(), CpuMode::Pmode);

        let report = BootReport {
            handoff: self.handoff,
            backend: switch.backend().kind(),
            extended_source: extended,
            vcpi_version: self.negotiator.version(),
            irq_window: match switch.backend() {
                Backend::Vcpi(s) => Some(s.irq_window),
                Backend::Raw => None,
            },
            dpmi_host_seen: self.dpmi.detected(),
            conventional_bytes: self
                .pool
                .bytes_with_flags(RangeFlags::BELOW_1M | RangeFlags::BELOW_16M),
            total_bytes: self.pool.total_bytes(),
            max_address: self.pool.max_address(),
        };
        self.switch = Some(switch);
        Ok(report)
    }

    /// Undo everything undoable and land back in real mode. Safe to call
    /// whether or not `run` succeeded; later calls are no-ops.
    pub fn shutdown(&mut self, bus: &mut dyn HostBus) -> Result<(), BootError> {
        if let Some(switch) = self.switch.as_mut() {
            if bus.mode() == CpuMode::Pmode {
                switch.to_real(bus)?;
            }
            self.negotiator.shutdown(bus, switch)?;
        }
        self.xms.release(bus);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::{Event, MockHost};
    use crate::mem::range::SIXTEEN_MB;

    #[test]
    fn raw_bootstrap_conserves_bios_reported_memory() {
        let mut host = MockHost::new();
        host.e801_low_kb = 0x3C00; // 15 MiB: fills 1..16 MiB exactly
        host.e801_high_64k = 0x30; // 3 MiB above 16 MiB

        let mut boot = Bootstrap::new(Handoff::Multiboot);
        let report = boot.run(&mut host).unwrap();

        assert_eq!(report.backend, BackendKind::Raw);
        assert_eq!(report.extended_source, ExtendedSource::RawBios);
        assert_eq!(report.conventional_bytes, 640 * 1024);
        assert_eq!(
            boot.pool().bytes_with_flags(RangeFlags::BELOW_16M),
            15 * ONE_MB
        );
        assert_eq!(
            boot.pool().bytes_with_flags(RangeFlags::empty()),
            3 * ONE_MB
        );
        assert_eq!(report.total_bytes, 640 * 1024 + 18 * ONE_MB);
        assert_eq!(report.max_address, SIXTEEN_MB + 3 * ONE_MB);
        assert_eq!(host.mode(), CpuMode::Pmode);
    }

    #[test]
    fn reserved_image_stays_out_of_the_pool() {
        let mut host = MockHost::new();
        let mut boot = Bootstrap::new(Handoff::Multiboot);
        boot.reserve_image(0x1_0000, 0x8000);
        let report = boot.run(&mut host).unwrap();

        assert_eq!(report.conventional_bytes, 640 * 1024 - 0x8000);
        // The hole splits conventional memory in two.
        assert_eq!(
            boot.pool()
                .regions()
                .iter()
                .filter(|r| r.flags.contains(RangeFlags::BELOW_1M))
                .count(),
            2
        );
    }

    #[test]
    fn dos_handoff_honors_the_arena() {
        let mut host = MockHost::new();
        let mut boot = Bootstrap::new(Handoff::Dos);
        let report = boot.run(&mut host).unwrap();
        assert_eq!(
            report.conventional_bytes,
            (host.dos_largest_paras as u64) << 4
        );
    }

    #[test]
    fn xms_wins_over_the_raw_bios_reports() {
        let mut host = MockHost::new();
        host.xms_present = true;

        let mut boot = Bootstrap::new(Handoff::Dos);
        let report = boot.run(&mut host).unwrap();

        assert_eq!(report.backend, BackendKind::Raw);
        assert_eq!(report.extended_source, ExtendedSource::Xms);
        assert_eq!(
            report.total_bytes,
            ((host.dos_largest_paras as u64) << 4) + host.xms_largest_kb as u64 * 1024
        );
        // The XMS manager owns the A20 gate; the bootstrap went through
        // its entry point, not the hardware.
        assert!(host.events().contains(&Event::XmsCall(0x05)));
    }

    #[test]
    fn vcpi_bootstrap_end_to_end() {
        let mut host = MockHost::with_vcpi();
        let harvest = host.vcpi_free_pages.len() as u64 * 4096;
        let top_page = *host.vcpi_free_pages.last().unwrap() as u64;

        let mut boot = Bootstrap::new(Handoff::Dos);
        let report = boot.run(&mut host).unwrap();

        assert_eq!(report.backend, BackendKind::Vcpi);
        assert_eq!(report.extended_source, ExtendedSource::Vcpi);
        assert_eq!(report.vcpi_version, Some((1, 0)));
        assert_eq!(report.irq_window.unwrap().master_base, 0xF8);
        assert!(!report.dpmi_host_seen);
        assert_eq!(host.mode(), CpuMode::Pmode);

        assert!(report.conventional_bytes > 0x5_0000);
        assert_eq!(report.max_address, top_page + 4096);
        assert!(report.total_bytes > harvest);
    }

    #[test]
    fn vcpi_low_memory_falls_back_to_raw() {
        let mut host = MockHost::with_vcpi();
        host.dos_largest_paras = 0x10; // no room for bootstrap page tables

        let mut boot = Bootstrap::new(Handoff::Dos);
        let report = boot.run(&mut host).unwrap();
        assert_eq!(report.backend, BackendKind::Raw);
        assert_eq!(report.extended_source, ExtendedSource::RawBios);
    }

    #[test]
    fn hostile_vcpi_host_is_fatal() {
        let mut host = MockHost::with_vcpi();
        host.vcpi_bad_descriptor = true;
        let mut boot = Bootstrap::new(Handoff::Dos);
        assert!(matches!(
            boot.run(&mut host),
            Err(BootError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn dpmi_host_is_reported_but_unused() {
        let mut host = MockHost::new();
        host.dpmi_present = true;
        let mut boot = Bootstrap::new(Handoff::Dos);
        let report = boot.run(&mut host).unwrap();
        assert!(report.dpmi_host_seen);
        assert_eq!(report.backend, BackendKind::Raw);
    }

    #[test]
    fn shutdown_lands_back_in_real_mode() {
        let mut host = MockHost::with_vcpi();
        let mut boot = Bootstrap::new(Handoff::Dos);
        boot.run(&mut host).unwrap();

        boot.shutdown(&mut host).unwrap();
        assert_eq!(host.mode(), CpuMode::Real);
        assert_eq!(host.pic_bases(), (0x08, 0x70));
        assert!(host.ems_live_handles.is_empty());

        // Safe to repeat.
        boot.shutdown(&mut host).unwrap();
        assert_eq!(host.mode(), CpuMode::Real);
    }
}

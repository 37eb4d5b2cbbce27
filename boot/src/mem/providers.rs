/// Competing memory providers.
///
/// Each provider discovers one physical range through its host protocol
/// and stashes it - the pool may not be reachable before paging is
/// stable - then merges it into `PhysMemPool` when the sequencer calls
/// `collect`. Collect is idempotent; a second call is a no-op. Probe
/// order (and merge priority) is VCPI > DPMI-stub > XMS > raw extended,
/// with DOS conventional memory probed unconditionally first.
use crate::error::BootError;
use crate::host::{CpuMode, HostBus, RealPtr, RegisterBlock};
use crate::mode::ModeSwitch;

use super::pool::PhysMemPool;
use super::range::{MemoryRange, ONE_MB, PAGE_SIZE};

pub const PRIO_DOS: u8 = 1;
pub const PRIO_RAW_BIOS: u8 = 2;
pub const PRIO_XMS: u8 = 3;
pub const PRIO_DPMI: u8 = 4;
pub const PRIO_VCPI: u8 = 5;

/// Collaborator contract for the bootstrap sequencer.
pub trait MemoryProvider {
    /// Discover this provider's range. Non-blocking where the host
    /// protocol allows; `None` means the provider is absent (not an
    /// error).
    fn probe(&mut self, bus: &mut dyn HostBus) -> Option<MemoryRange>;

    /// Merge the stashed range(s) into the pool. Idempotent.
    fn collect(
        &mut self,
        bus: &mut dyn HostBus,
        switch: &mut ModeSwitch,
        pool: &mut PhysMemPool,
    ) -> Result<(), BootError>;
}

// ---- DOS conventional memory ----

pub struct DosProvider {
    /// Whether DOS services (int 0x21) exist on this handoff. Raw
    /// multiboot/Linux-style handoffs only have the BIOS.
    dos_services: bool,
    stash: Option<MemoryRange>,
    /// Bytes the stash must never contribute (the live boot image). The
    /// DOS arena already excludes the image; BIOS-only handoffs report
    /// the whole conventional range and need the hole carved.
    excluded: Option<(u64, u64)>,
    collected: bool,
}

impl DosProvider {
    pub const fn new(dos_services: bool) -> Self {
        Self {
            dos_services,
            stash: None,
            excluded: None,
            collected: false,
        }
    }

    /// Keep `[base, base+size)` out of the pool.
    pub fn exclude(&mut self, base: u64, size: u64) {
        self.excluded = Some((base, base + size));
    }

    /// Carve `bytes` (aligned to `align`) off the top of the stashed low
    /// range, before it reaches the pool. The VCPI path uses this for
    /// its bootstrap page tables.
    pub fn reserve_low(&mut self, bytes: u32, align: u32) -> Option<u32> {
        let stash = self.stash.as_mut()?;
        let end = stash.end();
        let base = (end.checked_sub(bytes as u64)?) & !(align as u64 - 1);
        if base < stash.base {
            return None;
        }
        stash.size = base - stash.base;
        Some(base as u32)
    }

    pub fn stashed(&self) -> Option<MemoryRange> {
        self.stash
    }
}

impl MemoryProvider for DosProvider {
    fn probe(&mut self, bus: &mut dyn HostBus) -> Option<MemoryRange> {
        if self.stash.is_some() {
            return self.stash;
        }

        let range = if self.dos_services {
            // Largest free DOS block: ask for the impossible, read the
            // real maximum back, then take it.
            let mut regs = RegisterBlock::default();
            regs.set_ax(0x4800);
            regs.ebx = 0xFFFF;
            bus.real_int(0x21, &mut regs);
            let largest_paras = regs.ebx & 0xFFFF;
            if largest_paras == 0 {
                return None;
            }
            let mut regs = RegisterBlock::default();
            regs.set_ax(0x4800);
            regs.ebx = largest_paras;
            bus.real_int(0x21, &mut regs);
            if regs.carry() {
                return None;
            }
            let segment = regs.eax & 0xFFFF;
            MemoryRange::new((segment as u64) << 4, (largest_paras as u64) << 4, PRIO_DOS)
        } else {
            // No DOS arena to honor - the whole conventional range as
            // the BIOS reports it.
            let mut regs = RegisterBlock::default();
            bus.real_int(0x12, &mut regs);
            let kb = regs.eax & 0xFFFF;
            if kb == 0 {
                return None;
            }
            MemoryRange::new(0, kb as u64 * 1024, PRIO_DOS)
        };

        self.stash = Some(range);
        self.stash
    }

    fn collect(
        &mut self,
        _bus: &mut dyn HostBus,
        _switch: &mut ModeSwitch,
        pool: &mut PhysMemPool,
    ) -> Result<(), BootError> {
        if self.collected {
            return Ok(());
        }
        if let Some(r) = self.stash {
            match self.excluded {
                Some((ex_start, ex_end)) if ex_start < r.end() && ex_end > r.base => {
                    if ex_start > r.base {
                        pool.add_with_priority(r.base, ex_start - r.base, r.priority)?;
                    }
                    if ex_end < r.end() {
                        pool.add_with_priority(ex_end, r.end() - ex_end, r.priority)?;
                    }
                }
                _ => pool.add_with_priority(r.base, r.size, r.priority)?,
            }
        }
        self.collected = true;
        Ok(())
    }
}

// ---- XMS extended memory ----

pub struct XmsProvider {
    entry: Option<RealPtr>,
    handle: Option<u16>,
    stash: Option<MemoryRange>,
    collected: bool,
}

impl XmsProvider {
    pub const fn new() -> Self {
        Self {
            entry: None,
            handle: None,
            stash: None,
            collected: false,
        }
    }

    /// XMS dispatch entry point, once detected - also the A20 control
    /// path when an XMS manager owns the gate.
    pub fn entry(&self) -> Option<RealPtr> {
        self.entry
    }

    fn dispatch(&self, bus: &mut dyn HostBus, regs: &mut RegisterBlock) -> bool {
        match self.entry {
            Some(entry) => {
                bus.real_far_call(entry, regs);
                true
            }
            None => false,
        }
    }

    /// Unlock and free the extended block. Only used when the bootstrap
    /// aborts before the memory was permanently claimed.
    pub fn release(&mut self, bus: &mut dyn HostBus) {
        if let Some(handle) = self.handle.take() {
            let mut regs = RegisterBlock::default();
            regs.set_ax(0x0D00); // unlock EMB
            regs.edx = handle as u32;
            self.dispatch(bus, &mut regs);

            let mut regs = RegisterBlock::default();
            regs.set_ax(0x0A00); // free EMB
            regs.edx = handle as u32;
            self.dispatch(bus, &mut regs);
        }
        self.stash = None;
    }
}

impl MemoryProvider for XmsProvider {
    fn probe(&mut self, bus: &mut dyn HostBus) -> Option<MemoryRange> {
        if self.stash.is_some() {
            return self.stash;
        }

        // Installation check, then the dispatch entry point.
        let mut regs = RegisterBlock::default();
        regs.set_ax(0x4300);
        bus.real_int(0x2F, &mut regs);
        if regs.al() != 0x80 {
            return None;
        }
        let mut regs = RegisterBlock::default();
        regs.set_ax(0x4310);
        bus.real_int(0x2F, &mut regs);
        let entry = RealPtr::new(regs.es, regs.ebx as u16);
        self.entry = Some(entry);

        // Largest free extended block, in KB.
        let mut regs = RegisterBlock::default();
        regs.set_ax(0x0800);
        self.dispatch(bus, &mut regs);
        let largest_kb = regs.eax & 0xFFFF;
        if largest_kb == 0 {
            return None;
        }

        // Allocate and lock it; the lock's physical address is the range
        // base.
        let mut regs = RegisterBlock::default();
        regs.set_ax(0x0900);
        regs.edx = largest_kb;
        self.dispatch(bus, &mut regs);
        if regs.eax & 0xFFFF != 1 {
            return None;
        }
        let handle = regs.edx as u16;

        let mut regs = RegisterBlock::default();
        regs.set_ax(0x0C00);
        regs.edx = handle as u32;
        self.dispatch(bus, &mut regs);
        if regs.eax & 0xFFFF != 1 {
            // Locked allocation failed; give the block back.
            let mut regs = RegisterBlock::default();
            regs.set_ax(0x0A00);
            regs.edx = handle as u32;
            self.dispatch(bus, &mut regs);
            return None;
        }
        let phys = ((regs.edx & 0xFFFF) << 16) | (regs.ebx & 0xFFFF);

        self.handle = Some(handle);
        self.stash = Some(MemoryRange::new(
            phys as u64,
            largest_kb as u64 * 1024,
            PRIO_XMS,
        ));
        self.stash
    }

    fn collect(
        &mut self,
        _bus: &mut dyn HostBus,
        _switch: &mut ModeSwitch,
        pool: &mut PhysMemPool,
    ) -> Result<(), BootError> {
        if self.collected {
            return Ok(());
        }
        if let Some(r) = self.stash {
            pool.add_with_priority(r.base, r.size, r.priority)?;
        }
        self.collected = true;
        Ok(())
    }
}

// ---- Raw BIOS extended-memory probes ----

pub struct RawBiosProvider {
    below_16m: Option<MemoryRange>,
    above_16m: Option<MemoryRange>,
    collected: bool,
}

impl RawBiosProvider {
    pub const fn new() -> Self {
        Self {
            below_16m: None,
            above_16m: None,
            collected: false,
        }
    }
}

impl MemoryProvider for RawBiosProvider {
    fn probe(&mut self, bus: &mut dyn HostBus) -> Option<MemoryRange> {
        if self.below_16m.is_some() {
            return self.below_16m;
        }

        // int 0x15 AX=0xE801: CX/AX = KB between 1 MiB and 16 MiB,
        // DX/BX = 64 KiB blocks above 16 MiB.
        let mut regs = RegisterBlock::default();
        regs.set_ax(0xE801);
        bus.real_int(0x15, &mut regs);
        if !regs.carry() {
            let low_kb = if regs.ecx & 0xFFFF != 0 {
                regs.ecx & 0xFFFF
            } else {
                regs.eax & 0xFFFF
            };
            let high_64k = if regs.edx & 0xFFFF != 0 {
                regs.edx & 0xFFFF
            } else {
                regs.ebx & 0xFFFF
            };
            if low_kb != 0 {
                self.below_16m = Some(MemoryRange::new(
                    ONE_MB,
                    low_kb as u64 * 1024,
                    PRIO_RAW_BIOS,
                ));
            }
            if high_64k != 0 {
                self.above_16m = Some(MemoryRange::new(
                    16 * ONE_MB,
                    high_64k as u64 * 0x1_0000,
                    PRIO_RAW_BIOS,
                ));
            }
            if self.below_16m.is_some() {
                return self.below_16m;
            }
        }

        // Fallback: int 0x15 AH=0x88, KB above 1 MiB.
        let mut regs = RegisterBlock::default();
        regs.set_ax(0x8800);
        bus.real_int(0x15, &mut regs);
        let kb = regs.eax & 0xFFFF;
        if regs.carry() || kb == 0 {
            return None;
        }
        self.below_16m = Some(MemoryRange::new(ONE_MB, kb as u64 * 1024, PRIO_RAW_BIOS));
        self.below_16m
    }

    fn collect(
        &mut self,
        _bus: &mut dyn HostBus,
        _switch: &mut ModeSwitch,
        pool: &mut PhysMemPool,
    ) -> Result<(), BootError> {
        if self.collected {
            return Ok(());
        }
        for r in [self.below_16m, self.above_16m].into_iter().flatten() {
            pool.add_with_priority(r.base, r.size, r.priority)?;
        }
        self.collected = true;
        Ok(())
    }
}

// ---- VCPI-reported memory ----

/// Harvests the VCPI host's free 4 KiB pages. Probe reports capacity
/// (`DE02`/`DE03`); collect allocates every page (`DE04`) and lets the
/// pool coalesce whatever the host hands out. Pages stay allocated - the
/// bootstrap claims them permanently.
pub struct VcpiMemProvider {
    page_count: u32,
    max_phys: u64,
    detected: bool,
    collected: bool,
}

impl VcpiMemProvider {
    pub const fn new() -> Self {
        Self {
            page_count: 0,
            max_phys: 0,
            detected: false,
            collected: false,
        }
    }

    /// Highest physical address the host manages; the permanent mapping
    /// must reach it.
    pub fn max_phys(&self) -> u64 {
        self.max_phys
    }
}

impl MemoryProvider for VcpiMemProvider {
    fn probe(&mut self, bus: &mut dyn HostBus) -> Option<MemoryRange> {
        use crate::vcpi::session::{VCPI_DETECT, VCPI_FREE_PAGE_COUNT, VCPI_MAX_PHYS_ADDR};

        if self.detected {
            return Some(MemoryRange::new(
                0,
                self.page_count as u64 * PAGE_SIZE as u64,
                PRIO_VCPI,
            ));
        }

        let mut regs = RegisterBlock::default();
        regs.set_ax(VCPI_DETECT);
        bus.real_int(0x67, &mut regs);
        if regs.ah() != 0 {
            return None;
        }

        let mut regs = RegisterBlock::default();
        regs.set_ax(VCPI_MAX_PHYS_ADDR);
        bus.real_int(0x67, &mut regs);
        if regs.ah() == 0 {
            self.max_phys = regs.edx as u64;
        }

        let mut regs = RegisterBlock::default();
        regs.set_ax(VCPI_FREE_PAGE_COUNT);
        bus.real_int(0x67, &mut regs);
        if regs.ah() != 0 || regs.edx == 0 {
            return None;
        }
        self.page_count = regs.edx;
        self.detected = true;

        // Advisory: the host's pages are scattered, so the "range" is
        // capacity only; collect discovers the real addresses.
        Some(MemoryRange::new(
            0,
            self.page_count as u64 * PAGE_SIZE as u64,
            PRIO_VCPI,
        ))
    }

    fn collect(
        &mut self,
        bus: &mut dyn HostBus,
        switch: &mut ModeSwitch,
        pool: &mut PhysMemPool,
    ) -> Result<(), BootError> {
        use crate::vcpi::session::VCPI_ALLOC_PAGE;

        if self.collected || !self.detected {
            self.collected = true;
            return Ok(());
        }

        // One round trip for the whole harvest, not one per page.
        let was_pmode = switch.mode() == CpuMode::Pmode;
        if was_pmode {
            switch.to_real(bus)?;
        }

        let mut result = Ok(());
        for _ in 0..self.page_count {
            let mut regs = RegisterBlock::default();
            regs.set_ax(VCPI_ALLOC_PAGE);
            bus.real_int(0x67, &mut regs);
            if regs.ah() != 0 || regs.edx == 0 {
                break;
            }
            let page = (regs.edx & 0xFFFF_F000) as u64;
            if let Err(e) = pool.add_with_priority(page, PAGE_SIZE as u64, PRIO_VCPI) {
                result = Err(e);
                break;
            }
        }

        if was_pmode {
            switch.to_pmode(bus)?;
        }
        self.collected = true;
        result
    }
}

// ---- DPMI (stub) ----

/// Detects a resident DPMI host but never uses it - a full DPMI client
/// is out of scope. Reports absence so the chain falls through.
pub struct DpmiStubProvider {
    detected: bool,
}

impl DpmiStubProvider {
    pub const fn new() -> Self {
        Self { detected: false }
    }

    pub fn detected(&self) -> bool {
        self.detected
    }
}

impl MemoryProvider for DpmiStubProvider {
    fn probe(&mut self, bus: &mut dyn HostBus) -> Option<MemoryRange> {
        let mut regs = RegisterBlock::default();
        regs.set_ax(0x1687);
        bus.real_int(0x2F, &mut regs);
        self.detected = regs.eax & 0xFFFF == 0;
        // Stub: never offers memory even when a host answers.
        None
    }

    fn collect(
        &mut self,
        _bus: &mut dyn HostBus,
        _switch: &mut ModeSwitch,
        _pool: &mut PhysMemPool,
    ) -> Result<(), BootError> {
        Ok(())
    }
}

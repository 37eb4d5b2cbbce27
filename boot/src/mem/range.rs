/// Physical memory ranges as providers report them.
use core::fmt;

use bitflags::bitflags;

pub const PAGE_SIZE: u32 = 4096;

/// 1 MiB boundary - the real-mode addressing ceiling.
pub const ONE_MB: u64 = 0x10_0000;
/// 16 MiB boundary - the ISA DMA ceiling.
pub const SIXTEEN_MB: u64 = 0x100_0000;

bitflags! {
    /// Classification of a range by the legacy addressing ceilings it
    /// fits under. A range below 1 MiB carries both flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RangeFlags: u8 {
        const BELOW_1M  = 1 << 0;
        const BELOW_16M = 1 << 1;
    }
}

/// One contiguous span of usable physical memory.
///
/// Produced exactly once by a provider probe and consumed exactly once by
/// `PhysMemPool::add`; never mutated in between.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
    pub flags: RangeFlags,
    /// Provider preference; when overlapping ranges merge, the higher
    /// priority wins.
    pub priority: u8,
}

impl MemoryRange {
    pub fn new(base: u64, size: u64, priority: u8) -> Self {
        Self {
            base,
            size,
            flags: classify(base, size),
            priority,
        }
    }

    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

impl fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRange({:#x}..{:#x}, {:?}, prio {})",
            self.base,
            self.end(),
            self.flags,
            self.priority
        )
    }
}

/// Flags for a range that does not cross a classification boundary.
pub fn classify(base: u64, size: u64) -> RangeFlags {
    let end = base + size;
    let mut flags = RangeFlags::empty();
    if end <= ONE_MB {
        flags |= RangeFlags::BELOW_1M | RangeFlags::BELOW_16M;
    } else if end <= SIXTEEN_MB {
        flags |= RangeFlags::BELOW_16M;
    }
    flags
}

/// Split `[base, base+size)` at the 1 MiB and 16 MiB boundaries, calling
/// `f` once per piece. Pieces never cross a boundary, so `classify` gives
/// each a single flag set.
pub fn split_at_boundaries(base: u64, size: u64, mut f: impl FnMut(u64, u64)) {
    let end = base + size;
    let mut cursor = base;
    for boundary in [ONE_MB, SIXTEEN_MB] {
        if cursor < boundary && end > boundary {
            f(cursor, boundary - cursor);
            cursor = boundary;
        }
    }
    if cursor < end {
        f(cursor, end - cursor);
    }
}

/// Free physical memory pool - coalescing, priority-classified list.
///
/// Providers stash ranges during probing (the pool may not be reachable
/// before paging is stable) and merge them here once protected mode and
/// the identity mappings are up. Regions are kept sorted by base and
/// coalesced on insert, so adding the same range twice or adding disjoint
/// ranges in any order yields the same pool.
use heapless::Vec;

use super::range::{classify, split_at_boundaries, MemoryRange, RangeFlags};
use crate::error::BootError;

/// Upper bound on distinct regions after coalescing. Real memory maps
/// stay well under this; overflowing it is a fatal resource error.
const MAX_REGIONS: usize = 32;

pub struct PhysMemPool {
    regions: Vec<MemoryRange, MAX_REGIONS>,
}

impl PhysMemPool {
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Merge `[base, base+size)` into the pool.
    ///
    /// The range is split at the 1 MiB / 16 MiB classification boundaries,
    /// then each piece is inserted sorted and coalesced with any adjacent
    /// or overlapping neighbor of the same class. Must only be called
    /// while the bytes being merged are safely dereferenceable.
    pub fn add(&mut self, base: u64, size: u64) -> Result<(), BootError> {
        self.add_with_priority(base, size, 0)
    }

    pub fn add_with_priority(
        &mut self,
        base: u64,
        size: u64,
        priority: u8,
    ) -> Result<(), BootError> {
        if size == 0 {
            return Ok(());
        }
        let mut result = Ok(());
        split_at_boundaries(base, size, |piece_base, piece_size| {
            if result.is_ok() {
                result = self.insert_piece(piece_base, piece_size, priority);
            }
        });
        result
    }

    /// Insert one boundary-aligned piece, coalescing in place.
    fn insert_piece(&mut self, base: u64, size: u64, priority: u8) -> Result<(), BootError> {
        let flags = classify(base, size);
        let mut new = MemoryRange {
            base,
            size,
            flags,
            priority,
        };

        // Merge every same-class region that touches or overlaps the new
        // one. Cross-class regions meet only at a classification boundary
        // and must stay separate, or the per-class accounting is lost.
        let mut i = 0;
        while i < self.regions.len() {
            let r = self.regions[i];
            if r.end() < new.base || new.end() < r.base || r.flags != flags {
                i += 1;
                continue;
            }
            let merged_base = r.base.min(new.base);
            let merged_end = r.end().max(new.end());
            new = MemoryRange {
                base: merged_base,
                size: merged_end - merged_base,
                flags: classify(merged_base, merged_end - merged_base),
                priority: r.priority.max(new.priority),
            };
            self.regions.remove(i);
        }

        let pos = self
            .regions
            .iter()
            .position(|r| r.base > new.base)
            .unwrap_or(self.regions.len());
        self.regions
            .insert(pos, new)
            .map_err(|_| BootError::ResourceExhausted("physical memory region list full"))
    }

    /// Highest address covered by any pooled region.
    pub fn max_address(&self) -> u64 {
        self.regions.iter().map(|r| r.end()).max().unwrap_or(0)
    }

    /// Total usable bytes.
    pub fn total_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }

    /// Total bytes whose region carries exactly `flags`.
    pub fn bytes_with_flags(&self, flags: RangeFlags) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.flags == flags)
            .map(|r| r.size)
            .sum()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[MemoryRange] {
        &self.regions
    }

    /// Carve `pages` 4 KiB pages out of the pool, preferring the highest
    /// region of at least the requested class. Used once the pool is live
    /// to feed the permanent page-table build.
    pub fn alloc_pages(&mut self, pages: u32) -> Result<u64, BootError> {
        let page = super::range::PAGE_SIZE as u64;
        let bytes = pages as u64 * page;
        // Take from the end of the highest suitable region so low memory
        // (DMA, real-mode callable) is spent last.
        let mut best: Option<(usize, u64)> = None;
        for (i, r) in self.regions.iter().enumerate() {
            if r.size < bytes {
                continue;
            }
            let base = (r.end() - bytes) & !(page - 1);
            if base < r.base {
                continue;
            }
            let better = match best {
                Some((_, b)) => base > b,
                None => true,
            };
            if better {
                best = Some((i, base));
            }
        }
        let (i, base) =
            best.ok_or(BootError::ResourceExhausted("no free pages in pool"))?;
        let r = &mut self.regions[i];
        let taken = r.end() - base;
        r.size -= taken;
        if r.size == 0 {
            self.regions.remove(i);
        }
        if taken > bytes {
            // Alignment slack above the carved pages goes back in.
            let _ = self.insert_piece(base + bytes, taken - bytes, 0);
        }
        Ok(base)
    }
}

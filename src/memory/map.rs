// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

use std::ops::Range;

use crate::memory::{Address, BusError, MemoryRegion, Width};

#[derive(Debug)]
pub struct MemoryMapBuilder {
    entries: Vec<MemoryRegion>,
}

#[derive(Debug)]
pub enum MemoryMapError {
    Overlaps {
        region: MemoryRegion,
        overlaps_with: Range<Address>,
    },
}

impl std::fmt::Display for MemoryMapError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for MemoryMapError {}

impl MemoryMapBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add_region(&mut self, new: MemoryRegion) -> Result<(), MemoryMapError> {
        let range: Range<Address> = Range::from(&new);
        for existing in &self.entries {
            let other = Range::<Address>::from(existing);
            if range.start < other.end && other.start < range.end {
                return Err(MemoryMapError::Overlaps {
                    region: new,
                    overlaps_with: other,
                });
            }
        }
        self.entries.push(new);
        Ok(())
    }

    pub fn with_region(mut self, new: MemoryRegion) -> Result<Self, MemoryMapError> {
        self.add_region(new)?;
        Ok(self)
    }

    pub fn build(self) -> MemoryMap {
        let Self { mut entries } = self;
        entries.sort();
        MemoryMap { regions: entries }
    }
}

impl Default for MemoryMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A flattened physical memory map of the guest.
///
/// Regions are non-overlapping and sorted; lookups binary-search by start
/// offset.
#[derive(Debug)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    #[inline]
    pub fn builder() -> MemoryMapBuilder {
        MemoryMapBuilder::new()
    }

    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn find_region(&self, addr: Address) -> Option<&MemoryRegion> {
        let index = match self.regions.binary_search_by_key(&addr, |x| x.phys_offset) {
            Ok(x) => Some(x),
            // Within the closest region with starting address < addr
            Err(x) if (x > 0 && addr.0 < self.regions[x - 1].last_addr().0) => Some(x - 1),
            _ => None,
        };
        index.and_then(|x| self.regions.get(x))
    }

    pub fn find_region_mut(&mut self, addr: Address) -> Option<&mut MemoryRegion> {
        let index = match self.regions.binary_search_by_key(&addr, |x| x.phys_offset) {
            Ok(x) => Some(x),
            // Within the closest region with starting address < addr
            Err(x) if (x > 0 && addr.0 < self.regions[x - 1].last_addr().0) => Some(x - 1),
            _ => None,
        };
        index.and_then(|x| self.regions.get_mut(x))
    }

    /// Performs a read transaction against the region covering `addr`.
    pub fn read(&self, addr: Address, width: Width) -> Result<u64, BusError> {
        let Some(region) = self.find_region(addr) else {
            return Err(BusError::Unmapped { address: addr });
        };
        region.read(addr.0 - region.phys_offset.0, width)
    }

    /// Performs a write transaction against the region covering `addr`.
    pub fn write(&mut self, addr: Address, value: u64, width: Width) -> Result<(), BusError> {
        let Some(region) = self.find_region_mut(addr) else {
            return Err(BusError::Unmapped { address: addr });
        };
        region.write(addr.0 - region.phys_offset.0, value, width)
    }

    /// Atomic compare-and-swap against the RAM region covering `addr`.
    pub fn compare_exchange(
        &self,
        addr: Address,
        expected: u64,
        new: u64,
        width: Width,
    ) -> Result<bool, BusError> {
        let Some(region) = self.find_region(addr) else {
            return Err(BusError::Unmapped { address: addr });
        };
        region.compare_exchange(addr.0 - region.phys_offset.0, expected, new, width)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }
}

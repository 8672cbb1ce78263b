// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

#![allow(clippy::len_without_is_empty)]

use std::{
    cmp::Ordering,
    ffi::CString,
    ops::Range,
    os::fd::OwnedFd,
    sync::atomic::{AtomicU32, AtomicU64, Ordering as MemOrdering},
};

use nix::{errno::Errno, sys::memfd};

use crate::memory::{Address, MemorySize};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
/// Bus transaction width in bits.
pub enum Width {
    _64 = 64,
    _32 = 32,
    _16 = 16,
    _8 = 8,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> u64 {
        self as i32 as u64 / 8
    }
}

/// A failed bus transaction.
///
/// Physical accesses return this instead of raw data so that callers (the
/// page-table walker in particular) can tell apart unbacked, read-only and
/// device-backed targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusError {
    /// No region covers the address.
    Unmapped { address: Address },
    /// The access runs past the end of the covering region.
    OutOfBounds { address: Address },
    /// The covering region is read-only.
    ReadOnly { address: Address },
    /// The operation requires RAM backing (e.g. an atomic page-table entry
    /// update) but the covering region is a device or ROM.
    NotRam { address: Address },
}

impl std::fmt::Display for BusError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Unmapped { address } => write!(fmt, "no memory mapped at {address}"),
            Self::OutOfBounds { address } => write!(fmt, "access at {address} crosses region end"),
            Self::ReadOnly { address } => write!(fmt, "write to read-only memory at {address}"),
            Self::NotRam { address } => write!(fmt, "address {address} is not RAM-backed"),
        }
    }
}

impl std::error::Error for BusError {}

pub struct MmappedMemory {
    pub fd: OwnedFd,
    pub map: memmap2::MmapMut,
    pub read_only: bool,
}

impl std::fmt::Debug for MmappedMemory {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("MmappedMemory")
            .field("fd", &self.fd)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Operations of a device-backed (MMIO) region.
///
/// Device models live outside this crate; the bus only needs enough to route
/// transactions and to refuse page-table updates targeting them.
pub trait DeviceMemoryOps: std::fmt::Debug {
    fn id(&self) -> u64;
    fn read(&self, address_inside_region: u64, width: Width) -> u64;
    fn write(&self, address_inside_region: u64, value: u64, width: Width);
}

#[derive(Debug)]
pub enum MemoryBacking {
    Mmap(MmappedMemory),
    Device(Box<dyn DeviceMemoryOps>),
}

pub struct MemoryRegion {
    /// Offset from start of physical address space.
    pub phys_offset: Address,
    pub size: MemorySize,
    pub backing: MemoryBacking,
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("MemoryRegion")
            .field("phys_offset", &self.phys_offset)
            .field("size", &self.size)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

impl Ord for MemoryRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = Range::<Address>::from(self);
        let b = Range::<Address>::from(other);
        (a.start, a.end).cmp(&(b.start, b.end))
    }
}

impl PartialOrd for MemoryRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MemoryRegion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemoryRegion {}

impl From<&MemoryRegion> for Range<Address> {
    fn from(mr: &MemoryRegion) -> Self {
        let start = mr.phys_offset;
        Self {
            start,
            end: Address(start.0 + mr.size.0.get()),
        }
    }
}

impl MemoryRegion {
    /// Returns a RAM region backed by an `mmap(2)` created area.
    pub fn new(name: &str, size: MemorySize, phys_offset: Address) -> Result<Self, Errno> {
        Self::new_inner(name, size, phys_offset, false)
    }

    /// Returns a read-only (ROM) region backed by an `mmap(2)` created area.
    ///
    /// Guest stores and page-table A/D updates targeting it fail; load it
    /// through [`MmappedMemory::map`] directly from host code.
    pub fn new_rom(name: &str, size: MemorySize, phys_offset: Address) -> Result<Self, Errno> {
        Self::new_inner(name, size, phys_offset, true)
    }

    fn new_inner(
        name: &str,
        size: MemorySize,
        phys_offset: Address,
        read_only: bool,
    ) -> Result<Self, Errno> {
        if size.get().checked_add(phys_offset.0).is_none() {
            return Err(Errno::E2BIG);
        }
        let name = CString::new(name).unwrap();
        let fd = memfd::memfd_create(&name, memfd::MemFdCreateFlag::MFD_CLOEXEC)?;
        nix::unistd::ftruncate(&fd, size.get().try_into().unwrap())?;
        // SAFETY: `fd` is a valid file descriptor of length `size`.
        let mut map = unsafe { memmap2::MmapOptions::new().map_mut(&fd).unwrap() };
        #[cfg(target_os = "linux")]
        {
            // Don't include VM memory in dumped core files.
            _ = map.advise(memmap2::Advice::DontDump);
        }
        let u_size: usize = size.get().try_into().map_err(|_| Errno::ERANGE)?;
        debug_assert_eq!(map.len(), u_size);
        Ok(Self {
            phys_offset,
            size,
            backing: MemoryBacking::Mmap(MmappedMemory { fd, map, read_only }),
        })
    }

    /// Returns a device-backed region.
    pub fn new_io(
        size: MemorySize,
        phys_offset: Address,
        ops: Box<dyn DeviceMemoryOps>,
    ) -> Result<Self, Errno> {
        if size.get().checked_add(phys_offset.0).is_none() {
            return Err(Errno::E2BIG);
        }
        Ok(Self {
            phys_offset,
            size,
            backing: MemoryBacking::Device(ops),
        })
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.size.get() as usize
    }

    #[inline]
    pub const fn start_addr(&self) -> Address {
        self.phys_offset
    }

    #[inline]
    pub const fn last_addr(&self) -> Address {
        Address(self.phys_offset.0 + self.size.0.get())
    }

    #[inline]
    pub const fn is_ram(&self) -> bool {
        matches!(
            self.backing,
            MemoryBacking::Mmap(MmappedMemory {
                read_only: false,
                ..
            })
        )
    }

    #[inline]
    pub const fn as_mmap(&self) -> Option<&MmappedMemory> {
        if let MemoryBacking::Mmap(ref inner) = self.backing {
            return Some(inner);
        }
        None
    }

    #[inline]
    pub const fn as_mmap_mut(&mut self) -> Option<&mut MmappedMemory> {
        if let MemoryBacking::Mmap(ref mut inner) = self.backing {
            return Some(inner);
        }
        None
    }

    fn check_bounds(&self, address_inside_region: u64, width: Width) -> Result<(), BusError> {
        if address_inside_region
            .checked_add(width.bytes())
            .map_or(true, |end| end > self.size.get())
        {
            return Err(BusError::OutOfBounds {
                address: self.phys_offset + address_inside_region,
            });
        }
        Ok(())
    }

    /// Performs a read transaction at an offset inside this region.
    pub fn read(&self, address_inside_region: u64, width: Width) -> Result<u64, BusError> {
        self.check_bounds(address_inside_region, width)?;
        match self.backing {
            MemoryBacking::Mmap(MmappedMemory { ref map, .. }) => {
                // SAFETY: bounds were checked above.
                let source = unsafe { map.as_ptr().add(address_inside_region as usize) };
                // SAFETY: `source` is valid for `width` bytes and
                // `read_unaligned` has no alignment requirement.
                let value = unsafe {
                    match width {
                        Width::_8 => u64::from(std::ptr::read_unaligned(source)),
                        Width::_16 => {
                            u64::from(std::ptr::read_unaligned(source.cast::<u16>()).to_le())
                        }
                        Width::_32 => {
                            u64::from(std::ptr::read_unaligned(source.cast::<u32>()).to_le())
                        }
                        Width::_64 => std::ptr::read_unaligned(source.cast::<u64>()).to_le(),
                    }
                };
                Ok(value)
            }
            MemoryBacking::Device(ref ops) => Ok(ops.read(address_inside_region, width)),
        }
    }

    /// Performs a write transaction at an offset inside this region.
    pub fn write(
        &mut self,
        address_inside_region: u64,
        value: u64,
        width: Width,
    ) -> Result<(), BusError> {
        self.check_bounds(address_inside_region, width)?;
        match self.backing {
            MemoryBacking::Mmap(MmappedMemory {
                read_only: true, ..
            }) => Err(BusError::ReadOnly {
                address: self.phys_offset + address_inside_region,
            }),
            MemoryBacking::Mmap(MmappedMemory { ref mut map, .. }) => {
                // SAFETY: bounds were checked above.
                let destination = unsafe { map.as_mut_ptr().add(address_inside_region as usize) };
                // SAFETY: `destination` is valid for `width` bytes and
                // `write_unaligned` has no alignment requirement.
                unsafe {
                    match width {
                        Width::_8 => std::ptr::write_unaligned(destination, value as u8),
                        Width::_16 => {
                            std::ptr::write_unaligned(destination.cast::<u16>(), (value as u16).to_le())
                        }
                        Width::_32 => {
                            std::ptr::write_unaligned(destination.cast::<u32>(), (value as u32).to_le())
                        }
                        Width::_64 => {
                            std::ptr::write_unaligned(destination.cast::<u64>(), value.to_le())
                        }
                    }
                }
                Ok(())
            }
            MemoryBacking::Device(ref ops) => {
                ops.write(address_inside_region, value, width);
                Ok(())
            }
        }
    }

    /// Atomically replaces a naturally aligned 32 or 64-bit value, provided it
    /// still equals `expected`.
    ///
    /// Returns `Ok(true)` when the exchange took place and `Ok(false)` when
    /// another agent got there first. Page tables can only live in RAM: ROM
    /// and device regions fail with [`BusError::NotRam`].
    pub fn compare_exchange(
        &self,
        address_inside_region: u64,
        expected: u64,
        new: u64,
        width: Width,
    ) -> Result<bool, BusError> {
        self.check_bounds(address_inside_region, width)?;
        let address = self.phys_offset + address_inside_region;
        debug_assert_eq!(address_inside_region % width.bytes(), 0, "{address}");
        let MemoryBacking::Mmap(MmappedMemory {
            ref map,
            read_only: false,
            ..
        }) = self.backing
        else {
            return Err(BusError::NotRam { address });
        };
        // SAFETY: bounds were checked above and the offset is naturally
        // aligned; the atomic view aliases guest RAM which is shared between
        // harts by design.
        let exchanged = unsafe {
            let ptr = map.as_ptr().add(address_inside_region as usize) as *mut u8;
            match width {
                Width::_32 => AtomicU32::from_ptr(ptr.cast::<u32>())
                    .compare_exchange(
                        expected as u32,
                        new as u32,
                        MemOrdering::SeqCst,
                        MemOrdering::SeqCst,
                    )
                    .is_ok(),
                Width::_64 => AtomicU64::from_ptr(ptr.cast::<u64>())
                    .compare_exchange(expected, new, MemOrdering::SeqCst, MemOrdering::SeqCst)
                    .is_ok(),
                Width::_8 | Width::_16 => {
                    unreachable!("page-table entries are 4 or 8 bytes wide")
                }
            }
        };
        Ok(exchanged)
    }
}

// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Read-only page-table traversal for a debugger or monitor front end.
//!
//! Iterates the valid leaves of one translation stage for display. Nothing
//! here is a write path: entries are fetched over the bus, no
//! accessed/dirty updates happen, and faults simply end the corresponding
//! subtree.

use crate::{
    machine::RiscvMachine,
    memory::{Address, Pte, VirtualMemoryMode, Width, PAGE_SHIFT},
};

#[derive(Copy, Clone, Debug)]
/// One mapped leaf, as a monitor would print it.
pub struct MappedRange {
    /// Input (virtual or guest-physical) address of the mapping,
    /// sign-extended for first-stage spaces.
    pub base: Address,
    /// Extent of the leaf: base page, superpage or NAPOT range.
    pub size: u64,
    /// Output physical address.
    pub physical: Address,
    /// The decoded leaf entry.
    pub pte: Pte,
    /// Table level the leaf was found at, root first.
    pub level: u32,
}

struct Frame {
    table: Address,
    level: u32,
    index: u64,
    va_prefix: u64,
}

/// Iterator over the valid leaves of a page table.
pub struct PageWalk<'a> {
    machine: &'a RiscvMachine,
    vm: VirtualMemoryMode,
    stack: Vec<Frame>,
}

impl RiscvMachine {
    /// Walks the currently active first-stage table.
    pub fn pagewalk_first_stage(&self) -> PageWalk<'_> {
        self.pagewalk(VirtualMemoryMode::from_satp(self.hart.satp, self.hart.xlen))
    }

    /// Walks the G-stage table.
    pub fn pagewalk_guest_stage(&self) -> PageWalk<'_> {
        self.pagewalk(VirtualMemoryMode::from_hgatp(self.hart.hgatp, self.hart.xlen))
    }

    /// Walks an arbitrary decoded address-space mode.
    pub fn pagewalk(&self, vm: VirtualMemoryMode) -> PageWalk<'_> {
        let stack = if vm.is_bare() {
            Vec::new()
        } else {
            vec![Frame {
                table: vm.root,
                level: 0,
                index: 0,
                va_prefix: 0,
            }]
        };
        PageWalk {
            machine: self,
            vm,
            stack,
        }
    }
}

fn entries_at(vm: &VirtualMemoryMode, level: u32) -> u64 {
    let widened = if level == 0 { vm.widened } else { 0 };
    1 << (vm.index_bits + widened)
}

/// Input-address bits covered below a table at `level`.
fn level_shift(vm: &VirtualMemoryMode, level: u32) -> u32 {
    PAGE_SHIFT + (vm.levels - 1 - level) * vm.index_bits
}

/// Sign-extend a first-stage input address for display.
fn extend(vm: &VirtualMemoryMode, address: u64) -> u64 {
    let va_bits = vm.va_bits();
    if vm.widened != 0 || va_bits >= 64 {
        return address;
    }
    if address >> (va_bits - 1) & 1 != 0 {
        address | (u64::MAX << va_bits)
    } else {
        address
    }
}

impl Iterator for PageWalk<'_> {
    type Item = MappedRange;

    fn next(&mut self) -> Option<MappedRange> {
        let vm = self.vm;
        let pte_width = match vm.pte_size {
            4 => Width::_32,
            8 => Width::_64,
            _ => unreachable!(),
        };
        while let Some(frame) = self.stack.last_mut() {
            let level = frame.level;
            if frame.index >= entries_at(&vm, level) {
                self.stack.pop();
                continue;
            }
            let index = frame.index;
            frame.index += 1;
            let table = frame.table;
            let va_prefix = frame.va_prefix;

            let pte_addr = table + index * vm.pte_size;
            let Ok(raw) = self.machine.memory.read(pte_addr, pte_width) else {
                // Table points outside backed memory; skip the subtree.
                self.stack.pop();
                continue;
            };
            let pte = Pte::from(raw);
            if !pte.v() {
                continue;
            }

            let shift = level_shift(&vm, level);
            let va = va_prefix | (index << shift);
            if pte.is_leaf() {
                return Some(MappedRange {
                    base: Address(extend(&vm, va)),
                    size: 1 << shift,
                    physical: Address(u64::from(pte.ppn()) << PAGE_SHIFT),
                    pte,
                    level,
                });
            }
            if level + 1 >= vm.levels {
                // Malformed: pointer at the final level.
                continue;
            }
            self.stack.push(Frame {
                table: Address(u64::from(pte.ppn()) << PAGE_SHIFT),
                level: level + 1,
                index: 0,
                va_prefix: va,
            });
        }
        None
    }
}

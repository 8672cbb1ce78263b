// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

use sechellia::{
    machine::RiscvMachine,
    memory::{Address, MemoryMap, MemoryRegion, MemorySize, Width},
};

#[macro_export]
macro_rules! assert_hex_eq {
    ($left: expr, $right: expr$(,)?) => {{
        let left: u64 = $left;
        let right: u64 = $right;
        assert_eq!(
            left,
            right,
            "Comparing {left_s} with {right_s} failed:\n0x{left:032x} {left_s}\n0x{right:032x} \
             {right_s}\n0b{left:064b} {left_s}\n0b{right:064b} {right_s}",
            left_s = stringify!($left),
            right_s = stringify!($right),
            left = left,
            right = right,
        );
    }};
}

/// Default DRAM base used by the tests.
pub const DRAM_BASE: u64 = 0x8000_0000;

#[allow(dead_code)]
pub fn make_test_machine(memory_size: u64) -> RiscvMachine {
    let memory = MemoryMap::builder()
        .with_region(
            MemoryRegion::new(
                "ram",
                MemorySize::new(memory_size).unwrap(),
                Address(DRAM_BASE),
            )
            .unwrap(),
        )
        .unwrap()
        .build();
    RiscvMachine::new(memory)
}

// Page-table entry flag bits, as the tests lay tables out by hand.
#[allow(dead_code)]
pub const PTE_V: u64 = 1 << 0;
#[allow(dead_code)]
pub const PTE_R: u64 = 1 << 1;
#[allow(dead_code)]
pub const PTE_W: u64 = 1 << 2;
#[allow(dead_code)]
pub const PTE_X: u64 = 1 << 3;
#[allow(dead_code)]
pub const PTE_U: u64 = 1 << 4;
#[allow(dead_code)]
pub const PTE_G: u64 = 1 << 5;
#[allow(dead_code)]
pub const PTE_A: u64 = 1 << 6;
#[allow(dead_code)]
pub const PTE_D: u64 = 1 << 7;
#[allow(dead_code)]
pub const PTE_N: u64 = 1 << 63;

/// Encodes a page-table entry pointing at physical address `pa`.
#[allow(dead_code)]
pub fn pte(pa: u64, flags: u64) -> u64 {
    ((pa >> 12) << 10) | flags
}

/// Stores a raw 64-bit page-table entry at physical address `at`.
#[allow(dead_code)]
pub fn store_pte(machine: &mut RiscvMachine, at: u64, value: u64) {
    machine
        .write_phys(Address(at), value, Width::_64)
        .expect("page tables must live in RAM");
}

/// `satp`/`vsatp` value selecting Sv39 with the given root table address.
#[allow(dead_code)]
pub fn satp_sv39(root: u64) -> u64 {
    (8 << 60) | (root >> 12)
}

/// `hgatp` value selecting Sv39x4 with the given root table address.
#[allow(dead_code)]
pub fn hgatp_sv39x4(root: u64) -> u64 {
    (8 << 60) | (root >> 12)
}

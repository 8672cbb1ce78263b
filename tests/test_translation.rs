// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

use sechellia::{
    cpu_state::{IsaExtensions, PrivilegeMode},
    memory::{AccessType, Address, FaultKind, Prot, Width},
};

#[macro_use]
mod utils;
use utils::*;

const MEMORY_SIZE: u64 = 4 * 1024 * 1024;

const ROOT: u64 = DRAM_BASE;
const L1: u64 = DRAM_BASE + 0x1000;
const L0: u64 = DRAM_BASE + 0x2000;
const DATA_PAGE: u64 = DRAM_BASE + 0x10_0000;

/// Builds an Sv39 table hierarchy covering the low gigabyte: `ROOT[0]` →
/// `L1`, `L1[0]` → `L0`, plus whatever leaves a test stores afterwards.
fn make_sv39_machine() -> sechellia::machine::RiscvMachine {
    let mut machine = make_test_machine(MEMORY_SIZE);
    machine.hart.privilege = PrivilegeMode::Supervisor;
    machine.hart.satp = satp_sv39(ROOT);
    store_pte(&mut machine, ROOT, pte(L1, PTE_V));
    store_pte(&mut machine, L1, pte(L0, PTE_V));
    machine
}

/// A `Bare` address space translates every address to itself with full
/// permissions.
#[test_log::test]
fn test_bare_round_trip() {
    let mut machine = make_test_machine(MEMORY_SIZE);
    machine.hart.privilege = PrivilegeMode::Supervisor;
    machine.hart.satp = 0;

    for va in [0u64, 0x1000, DRAM_BASE, DRAM_BASE + 0x12_3456] {
        let translation = machine
            .translate(
                Address(va),
                AccessType::Load,
                PrivilegeMode::Supervisor,
                false,
                false,
                false,
            )
            .unwrap();
        assert_hex_eq!(translation.physical.0, va);
        assert_eq!(translation.prot, Prot::all());
    }
}

/// A single Sv39 leaf with `R|W|V`: supervisor load succeeds and resolves to
/// the mapped frame, user load faults on the missing `U` bit.
#[test_log::test]
fn test_sv39_leaf_permissions() {
    let mut machine = make_sv39_machine();
    store_pte(&mut machine, L0 + 8, pte(DATA_PAGE, PTE_V | PTE_R | PTE_W));

    let translation = machine
        .translate(
            Address(0x1000),
            AccessType::Load,
            PrivilegeMode::Supervisor,
            false,
            false,
            false,
        )
        .unwrap();
    assert_hex_eq!(translation.physical.0, DATA_PAGE);
    assert_eq!(translation.page_size, 0x1000);

    let fault = machine
        .translate(
            Address(0x1000),
            AccessType::Load,
            PrivilegeMode::User,
            false,
            false,
            false,
        )
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);
}

/// Byte offsets inside a 2 MiB superpage map to one contiguous physical
/// range through the same table entry.
#[test_log::test]
fn test_sv39_superpage_coherence() {
    let mut machine = make_sv39_machine();
    const MEGAPAGE: u64 = DRAM_BASE + 0x20_0000;
    store_pte(
        &mut machine,
        L1 + 8,
        pte(MEGAPAGE, PTE_V | PTE_R | PTE_W | PTE_A | PTE_D),
    );

    for offset in [0u64, 0x123, 0x1000, 0x1f_ffff] {
        let translation = machine
            .translate(
                Address(0x20_0000 + offset),
                AccessType::Load,
                PrivilegeMode::Supervisor,
                false,
                false,
                false,
            )
            .unwrap();
        assert_hex_eq!(translation.physical.0, MEGAPAGE + offset);
        assert_eq!(translation.page_size, 0x20_0000);
    }

    // A superpage leaf whose PPN is not aligned on the 2 MiB boundary is
    // malformed.
    store_pte(
        &mut machine,
        L1 + 16,
        pte(MEGAPAGE + 0x1000, PTE_V | PTE_R | PTE_A),
    );
    let fault = machine
        .translate(
            Address(0x40_0000),
            AccessType::Load,
            PrivilegeMode::Supervisor,
            false,
            false,
            false,
        )
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);
}

/// Virtual addresses whose unused high bits are not a sign extension fail
/// without walking.
#[test_log::test]
fn test_sv39_sign_extension() {
    let machine = make_sv39_machine();
    let fault = machine
        .translate(
            Address(1 << 39),
            AccessType::Load,
            PrivilegeMode::Supervisor,
            false,
            false,
            false,
        )
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::AccessFault);
}

/// Malformed entries: a pointer carrying leaf-only attribute bits, and a
/// write-without-read leaf.
#[test_log::test]
fn test_sv39_reserved_encodings() {
    let mut machine = make_sv39_machine();

    store_pte(&mut machine, ROOT + 8, pte(L1, PTE_V | PTE_A));
    let fault = machine
        .translate(
            Address(1 << 30),
            AccessType::Load,
            PrivilegeMode::Supervisor,
            false,
            false,
            false,
        )
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);

    store_pte(&mut machine, L0 + 16, pte(DATA_PAGE, PTE_V | PTE_W));
    let fault = machine
        .translate(
            Address(0x2000),
            AccessType::Store,
            PrivilegeMode::Supervisor,
            false,
            false,
            false,
        )
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);
}

/// MXR lets a supervisor load read an execute-only page.
#[test_log::test]
fn test_mxr() {
    let mut machine = make_sv39_machine();
    store_pte(&mut machine, L0 + 24, pte(DATA_PAGE, PTE_V | PTE_X | PTE_A));

    let fault = machine
        .translate(
            Address(0x3000),
            AccessType::Load,
            PrivilegeMode::Supervisor,
            false,
            false,
            false,
        )
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);

    machine.hart.mstatus.set_mxr(true);
    let translation = machine
        .translate(
            Address(0x3000),
            AccessType::Load,
            PrivilegeMode::Supervisor,
            false,
            false,
            false,
        )
        .unwrap();
    assert!(translation.prot.contains(Prot::READ));
}

/// SUM gates supervisor data accesses to user pages; instruction fetches
/// from them never succeed.
#[test_log::test]
fn test_sum() {
    let mut machine = make_sv39_machine();
    store_pte(
        &mut machine,
        L0 + 32,
        pte(DATA_PAGE, PTE_V | PTE_R | PTE_X | PTE_U | PTE_A),
    );
    let va = Address(0x4000);

    let fault = machine
        .translate(va, AccessType::Load, PrivilegeMode::Supervisor, false, false, false)
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);

    machine.hart.mstatus.set_sum(true);
    machine
        .translate(va, AccessType::Load, PrivilegeMode::Supervisor, false, false, false)
        .unwrap();
    let fault = machine
        .translate(va, AccessType::Fetch, PrivilegeMode::Supervisor, false, false, false)
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);

    machine
        .translate(va, AccessType::Fetch, PrivilegeMode::User, false, false, false)
        .unwrap();
}

/// The accessed/dirty discipline: updates land in guest memory, a store
/// marks the entry dirty, and without the hardware-update capability the
/// access page-faults instead.
#[test_log::test]
fn test_accessed_dirty_update() {
    let mut machine = make_sv39_machine();
    let entry = L0 + 40;
    store_pte(&mut machine, entry, pte(DATA_PAGE, PTE_V | PTE_R | PTE_W));
    let va = Address(0x5000);

    machine
        .translate(va, AccessType::Load, PrivilegeMode::Supervisor, false, false, false)
        .unwrap();
    let raw = machine.read_phys(Address(entry), Width::_64).unwrap();
    assert!(raw & PTE_A != 0);
    assert!(raw & PTE_D == 0);

    machine
        .translate(va, AccessType::Store, PrivilegeMode::Supervisor, false, false, false)
        .unwrap();
    let raw = machine.read_phys(Address(entry), Width::_64).unwrap();
    assert!(raw & PTE_D != 0);

    // Debug walks leave the tables untouched.
    let entry2 = L0 + 48;
    store_pte(&mut machine, entry2, pte(DATA_PAGE, PTE_V | PTE_R));
    machine
        .translate(Address(0x6000), AccessType::Load, PrivilegeMode::Supervisor, false, false, true)
        .unwrap();
    let raw = machine.read_phys(Address(entry2), Width::_64).unwrap();
    assert!(raw & PTE_A == 0);

    // Without hardware updates, a needed update means a page fault.
    machine.hart.extensions.remove(IsaExtensions::SVADU);
    let fault = machine
        .translate(Address(0x6000), AccessType::Load, PrivilegeMode::Supervisor, false, false, false)
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);
}

/// NAPOT leaves: rejected without the extension, and composing the physical
/// address from the contiguous-range bits with it.
#[test_log::test]
fn test_napot_leaf() {
    let mut machine = make_sv39_machine();
    let napot_ppn = ((DATA_PAGE >> 12) & !0xf) | 0x8;
    store_pte(
        &mut machine,
        L0 + 56,
        (napot_ppn << 10) | PTE_V | PTE_R | PTE_A | PTE_N,
    );
    let va = Address(0x7000);

    let fault = machine
        .translate(va, AccessType::Load, PrivilegeMode::Supervisor, false, false, false)
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::PageFault);

    machine.hart.extensions.insert(IsaExtensions::SVNAPOT);
    let translation = machine
        .translate(va, AccessType::Load, PrivilegeMode::Supervisor, false, false, false)
        .unwrap();
    // Low four page-number bits come from the virtual address.
    let expect = (((DATA_PAGE >> 12) & !0xf) | 0x7) << 12;
    assert_hex_eq!(translation.physical.0, expect);
    assert_eq!(translation.page_size, 0x1_0000);
}

/// A successful fill installs the mapping into the TLB.
#[test_log::test]
fn test_fill_installs_tlb_entry() {
    let mut machine = make_sv39_machine();
    store_pte(
        &mut machine,
        L0 + 8,
        pte(DATA_PAGE, PTE_V | PTE_R | PTE_W | PTE_A | PTE_D),
    );

    assert!(machine.fill(Address(0x1000), 8, AccessType::Load, false));
    let entry = machine.tlb.get(0, 0, 0x1000).expect("fill installs");
    assert_hex_eq!(entry.ppn << 12, DATA_PAGE);
    assert!(entry.prot.contains(Prot::READ | Prot::WRITE));
}

/// An unmapped virtual address under `probe` reports failure without
/// dispatching a trap.
#[test_log::test]
fn test_probe_suppresses_trap() {
    let mut machine = make_sv39_machine();
    let pc_before = machine.hart.pc;
    assert!(!machine.fill(Address(0xdead_0000), 8, AccessType::Load, true));
    assert_eq!(machine.hart.pc, pc_before);
    assert_eq!(machine.hart.privilege, PrivilegeMode::Supervisor);
}

/// The monitor page-walk iterator reports the mapped leaves without
/// touching them.
#[test_log::test]
fn test_pagewalk_iterator() {
    let mut machine = make_sv39_machine();
    store_pte(&mut machine, L0 + 8, pte(DATA_PAGE, PTE_V | PTE_R | PTE_A));
    const MEGAPAGE: u64 = DRAM_BASE + 0x20_0000;
    store_pte(
        &mut machine,
        L1 + 8,
        pte(MEGAPAGE, PTE_V | PTE_R | PTE_X | PTE_A),
    );

    let leaves: Vec<_> = machine.pagewalk_first_stage().collect();
    assert_eq!(leaves.len(), 2);

    let small = leaves.iter().find(|l| l.base.0 == 0x1000).unwrap();
    assert_hex_eq!(small.physical.0, DATA_PAGE);
    assert_eq!(small.size, 0x1000);
    assert_eq!(small.level, 2);

    let large = leaves.iter().find(|l| l.base.0 == 0x20_0000).unwrap();
    assert_hex_eq!(large.physical.0, MEGAPAGE);
    assert_eq!(large.size, 0x20_0000);
}

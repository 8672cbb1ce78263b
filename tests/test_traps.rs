// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

use sechellia::{
    cpu_state::{IsaExtensions, PrivilegeMode, TrapVector, Xlen},
    exceptions::{transformed_instruction, Exception, TrapContext},
    interrupts::Interrupt,
    memory::Address,
};

#[macro_use]
mod utils;
use utils::*;

fn make_machine() -> sechellia::machine::RiscvMachine {
    let mut machine = make_test_machine(0x10000);
    machine.hart.pc = 0x1234;
    machine.hart.mtvec = TrapVector::from(0x100);
    machine.hart.stvec = TrapVector::from(0x200);
    machine
}

/// An undelegated exception traps to machine mode with the full register
/// save.
#[test_log::test]
fn test_machine_trap() {
    let mut machine = make_machine();
    machine.hart.privilege = PrivilegeMode::User;
    machine.hart.mstatus.set_mie(true);

    machine.take_trap(TrapContext::exception(
        Exception::LoadAccessFault,
        0xdead_beef,
    ));

    let hart = &machine.hart;
    assert_eq!(hart.privilege, PrivilegeMode::Machine);
    assert_hex_eq!(hart.mepc, 0x1234);
    assert_hex_eq!(hart.mcause, 5);
    assert_hex_eq!(hart.mtval, 0xdead_beef);
    assert_hex_eq!(hart.pc, 0x100);
    assert!(hart.mstatus.mpie());
    assert!(!hart.mstatus.mie());
    assert_eq!(u8::from(hart.mstatus.mpp()), 0);
}

/// `medeleg` hands a user-mode fault to supervisor mode.
#[test_log::test]
fn test_delegated_supervisor_trap() {
    let mut machine = make_machine();
    machine.hart.privilege = PrivilegeMode::User;
    machine.hart.medeleg = 1 << Exception::LoadPageFault.code();
    machine.hart.mstatus.set_sie(true);

    machine.take_trap(TrapContext::exception(Exception::LoadPageFault, 0x4000));

    let hart = &machine.hart;
    assert_eq!(hart.privilege, PrivilegeMode::Supervisor);
    assert_hex_eq!(hart.scause, 13);
    assert_hex_eq!(hart.sepc, 0x1234);
    assert_hex_eq!(hart.stval, 0x4000);
    assert_hex_eq!(hart.pc, 0x200);
    assert!(hart.mstatus.spie());
    assert!(!hart.mstatus.sie());
    assert_eq!(u8::from(hart.mstatus.spp()), 0);
}

/// Delegation never applies to traps taken from machine mode; `tval` for an
/// illegal instruction carries the instruction bits.
#[test_log::test]
fn test_no_delegation_from_machine_mode() {
    let mut machine = make_machine();
    machine.hart.privilege = PrivilegeMode::Machine;
    machine.hart.medeleg = 1 << Exception::IllegalInstruction.code();

    let mut ctx = TrapContext::exception(Exception::IllegalInstruction, 0);
    ctx.insn_bits = 0xbad;
    machine.take_trap(ctx);

    assert_eq!(machine.hart.privilege, PrivilegeMode::Machine);
    assert_hex_eq!(machine.hart.mcause, 2);
    assert_hex_eq!(machine.hart.mtval, 0xbad);
    assert_eq!(u8::from(machine.hart.mstatus.mpp()), 3);
}

/// Vectored trap vectors offset asynchronous causes only, and interrupt
/// causes set the top bit.
#[test_log::test]
fn test_vectored_interrupt() {
    let mut machine = make_machine();
    machine.hart.mtvec = TrapVector::from(0x300 | 1);

    machine.take_trap(TrapContext::interrupt(Interrupt::MachineTimer));
    assert_hex_eq!(machine.hart.pc, 0x300 + 4 * 7);
    assert_hex_eq!(machine.hart.mcause, 7 | (1 << 63));

    // A synchronous cause through the same vector lands on the base.
    machine.hart.pc = 0x1234;
    machine.take_trap(TrapContext::exception(Exception::Breakpoint, 0x1234));
    assert_hex_eq!(machine.hart.pc, 0x300);
}

/// A VS interrupt delegated through both levels stays in the guest under
/// its supervisor-level number.
#[test_log::test]
fn test_vs_interrupt_number_adjustment() {
    let mut machine = make_machine();
    machine.hart.extensions.insert(IsaExtensions::RVH);
    machine.hart.privilege = PrivilegeMode::Supervisor;
    machine.hart.virt_enabled = true;
    machine.hart.mideleg = 1 << 6;
    machine.hart.hideleg = 1 << 6;

    machine.take_trap(TrapContext::interrupt(Interrupt::VirtualSupervisorTimer));

    let hart = &machine.hart;
    assert!(hart.virt_enabled);
    assert_eq!(hart.privilege, PrivilegeMode::Supervisor);
    assert_hex_eq!(hart.scause, 5 | (1 << 63));
    assert_hex_eq!(hart.pc, 0x200);
}

/// An exception the hypervisor also delegated stays in VS mode without
/// touching the register views.
#[test_log::test]
fn test_vs_exception_stays_virtualized() {
    let mut machine = make_machine();
    machine.hart.extensions.insert(IsaExtensions::RVH);
    machine.hart.privilege = PrivilegeMode::User;
    machine.hart.virt_enabled = true;
    machine.hart.medeleg = 1 << Exception::LoadPageFault.code();
    machine.hart.hedeleg = 1 << Exception::LoadPageFault.code();
    machine.hart.satp = 0x1111;
    machine.hart.vsatp = 0x2222;

    machine.take_trap(TrapContext::exception(Exception::LoadPageFault, 0x4000));

    let hart = &machine.hart;
    assert!(hart.virt_enabled);
    assert_eq!(hart.privilege, PrivilegeMode::Supervisor);
    assert_hex_eq!(hart.scause, 13);
    assert_hex_eq!(hart.satp, 0x1111);
    assert_hex_eq!(hart.vsatp, 0x2222);
}

/// A delegated trap the hypervisor did not forward leaves the guest: the
/// supervisor register views swap and `hstatus` records the previous
/// virtualization state.
#[test_log::test]
fn test_trap_from_guest_to_hs() {
    let mut machine = make_machine();
    machine.hart.extensions.insert(IsaExtensions::RVH);
    machine.hart.privilege = PrivilegeMode::Supervisor;
    machine.hart.virt_enabled = true;
    machine.hart.medeleg = 1 << Exception::LoadPageFault.code();
    machine.hart.satp = 0x1111;
    machine.hart.vsatp = 0x2222;

    let mut ctx = TrapContext::exception(Exception::LoadPageFault, 0x4000);
    ctx.guest_phys_fault = 0x999;
    ctx.two_stage = true;
    machine.take_trap(ctx);

    let hart = &machine.hart;
    assert!(!hart.virt_enabled);
    assert_eq!(hart.privilege, PrivilegeMode::Supervisor);
    assert!(hart.hstatus.spv());
    assert_eq!(u8::from(hart.hstatus.spvp()), 1);
    assert!(hart.hstatus.gva());
    assert_hex_eq!(hart.htval, 0x999);
    // The guest and host register views swapped.
    assert_hex_eq!(hart.satp, 0x2222);
    assert_hex_eq!(hart.vsatp, 0x1111);
}

/// An undelegated trap from a guest lands in machine mode with
/// virtualization stripped and recorded in `mstatus`.
#[test_log::test]
fn test_trap_from_guest_to_machine() {
    let mut machine = make_machine();
    machine.hart.extensions.insert(IsaExtensions::RVH);
    machine.hart.privilege = PrivilegeMode::Supervisor;
    machine.hart.virt_enabled = true;

    let mut ctx = TrapContext::exception(Exception::LoadGuestPageFault, 0x4000);
    ctx.guest_phys_fault = 0x777;
    ctx.two_stage = true;
    machine.take_trap(ctx);

    let hart = &machine.hart;
    assert_eq!(hart.privilege, PrivilegeMode::Machine);
    assert!(!hart.virt_enabled);
    assert!(hart.mstatus.mpv());
    assert!(hart.mstatus.gva());
    assert_hex_eq!(hart.mcause, 21);
    assert_hex_eq!(hart.mtval2, 0x777);
}

/// Trap delivery always invalidates the load reservation.
#[test_log::test]
fn test_reservation_invalidated() {
    let mut machine = make_machine();
    machine.hart.reservation.set(Address(0x80));
    machine.take_trap(TrapContext::exception(Exception::Breakpoint, 0));
    assert!(!machine.hart.reservation.check(Address(0x80)));
}

/// A semihosting handler claims the cause without any mode change; without
/// one the magic breakpoint is delivered as an ordinary breakpoint.
#[test_log::test]
fn test_semihosting() {
    let mut machine = make_machine();
    machine.hart.privilege = PrivilegeMode::Supervisor;
    machine.semihost = Some(Box::new(|hart| {
        hart.gpr[10] = 42;
    }));

    machine.take_trap(TrapContext::exception(Exception::Semihost, 0));
    assert_eq!(machine.hart.gpr[10], 42);
    assert_eq!(machine.hart.privilege, PrivilegeMode::Supervisor);
    assert_hex_eq!(machine.hart.pc, 0x1234);

    machine.semihost = None;
    machine.take_trap(TrapContext::exception(Exception::Semihost, 0));
    assert_eq!(machine.hart.privilege, PrivilegeMode::Machine);
    assert_hex_eq!(machine.hart.mcause, 3);
    assert_hex_eq!(machine.hart.mtval, 0x1234);
}

/// `C.SW` widens to a `SW` whose immediate is the byte offset between the
/// faulting address and the base register, with bit 1 cleared to mark the
/// compressed origin.
#[test_log::test]
fn test_compressed_store_widening() {
    let mut gpr = [0u64; 32];
    gpr[8] = 0x7ffc;
    // C.SW x9, 4(x8)
    let insn = (0b110 << 13) | (1 << 6) | (1 << 2);
    let xinsn = transformed_instruction(Xlen::Rv64, insn, 0x8000, &gpr);
    assert_hex_eq!(xinsn, 0x0090_2221);
    // Decoded S-type immediate equals the fault offset.
    let imm = ((xinsn >> 7) & 0x1f) | (((xinsn >> 25) & 0x7f) << 5);
    assert_eq!(imm, 0x8000 - 0x7ffc);
    // Store opcode and width survive; bit 1 is cleared.
    assert_eq!(xinsn & 0x7f, 0x21);
    assert_eq!((xinsn >> 12) & 0x7, 0b010);
}

/// `C.LD` widens to an `LD` with the destination register preserved.
#[test_log::test]
fn test_compressed_load_widening() {
    let mut gpr = [0u64; 32];
    gpr[8] = 0x1000;
    // C.LD x9, 8(x8)
    let insn = (0b011 << 13) | (1 << 10) | (1 << 2);
    let xinsn = transformed_instruction(Xlen::Rv64, insn, 0x1008, &gpr);
    assert_hex_eq!(xinsn, 0x0080_3481);
}

/// A full-width load keeps its fields but swaps the immediate for the fault
/// offset and zeroes the base register.
#[test_log::test]
fn test_full_width_load_transform() {
    let mut gpr = [0u64; 32];
    gpr[5] = 0x2000;
    // LW x10, 16(x5)
    let insn = 0x03 | (2 << 12) | (10 << 7) | (5 << 15) | (16 << 20);
    let xinsn = transformed_instruction(Xlen::Rv64, insn, 0x2010, &gpr);
    assert_hex_eq!(xinsn, 0x0100_2503);
}

/// Instructions outside the load/store space produce no transformed value.
#[test_log::test]
fn test_widening_ignores_non_memory_instructions() {
    let gpr = [0u64; 32];
    // ADDI x1, x1, 1
    assert_eq!(
        transformed_instruction(Xlen::Rv64, 0x0010_8093, 0, &gpr),
        0
    );
    // C.J (quadrant 1)
    assert_eq!(transformed_instruction(Xlen::Rv64, 0xa001, 0, &gpr), 0);
}

// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Trap delivery.
//!
//! Routes a synchronous exception or a chosen interrupt to M, HS or VS
//! level per the delegation registers, performs the register save and mode
//! switch, and synthesizes the trap-value and trap-instruction CSRs.

use bilge::prelude::*;

use crate::{
    cpu_state::{IsaExtensions, PrivilegeMode, Xlen},
    interrupts::Interrupt,
    machine::RiscvMachine,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
/// Synchronous exception causes.
pub enum Exception {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAmoAddressMisaligned = 6,
    StoreAmoAccessFault = 7,
    EnvironmentCallFromU = 8,
    EnvironmentCallFromS = 9,
    EnvironmentCallFromVs = 10,
    EnvironmentCallFromM = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
    /// An `EBREAK` inside the semihosting magic sequence. Never delivered
    /// architecturally: either a host handler claims it or it decays to
    /// [`Self::Breakpoint`].
    Semihost = 16,
    InstructionGuestPageFault = 20,
    LoadGuestPageFault = 21,
    VirtualInstruction = 22,
    StoreGuestPageFault = 23,
}

impl Exception {
    #[inline]
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Whether `tval` carries a faulting address for this cause.
    const fn has_fault_address(self) -> bool {
        matches!(
            self,
            Self::InstructionAddressMisaligned
                | Self::InstructionAccessFault
                | Self::LoadAddressMisaligned
                | Self::LoadAccessFault
                | Self::StoreAmoAddressMisaligned
                | Self::StoreAmoAccessFault
                | Self::InstructionPageFault
                | Self::LoadPageFault
                | Self::StorePageFault
                | Self::InstructionGuestPageFault
                | Self::LoadGuestPageFault
                | Self::StoreGuestPageFault
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// A trap cause: synchronous exception or delivered interrupt.
pub enum Trap {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl Trap {
    #[inline]
    pub const fn code(self) -> u64 {
        match self {
            Self::Exception(e) => e.code(),
            Self::Interrupt(i) => i.code(),
        }
    }

    #[inline]
    pub const fn is_interrupt(self) -> bool {
        matches!(self, Self::Interrupt(_))
    }
}

#[derive(Copy, Clone, Debug)]
/// Everything the dispatcher needs to deliver one trap. Constructed fresh
/// per trap and consumed by [`RiscvMachine::take_trap`].
pub struct TrapContext {
    pub cause: Trap,
    /// Faulting address, or instruction bits for illegal-instruction
    /// causes.
    pub tval: u64,
    /// The faulting instruction's bits, for trap-instruction synthesis.
    pub insn_bits: u64,
    /// Guest-physical auxiliary value for `htval`/`mtval2`, already shifted
    /// right by two. Zero when absent.
    pub guest_phys_fault: u64,
    /// The faulting access went through two-stage translation (`GVA`
    /// reporting).
    pub two_stage: bool,
    /// The fault hit a G-stage translation of a VS-stage page-table entry
    /// address.
    pub two_stage_indirect: bool,
}

impl TrapContext {
    pub fn new(cause: Trap) -> Self {
        Self {
            cause,
            tval: 0,
            insn_bits: 0,
            guest_phys_fault: 0,
            two_stage: false,
            two_stage_indirect: false,
        }
    }

    pub fn exception(cause: Exception, tval: u64) -> Self {
        Self {
            tval,
            ..Self::new(Trap::Exception(cause))
        }
    }

    pub fn interrupt(irq: Interrupt) -> Self {
        Self::new(Trap::Interrupt(irq))
    }
}

impl RiscvMachine {
    /// Delivers a trap: the terminal step of every fault path. Control
    /// resumes at the selected handler; the caller unwinds to the
    /// instruction-dispatch loop.
    pub fn take_trap(&mut self, ctx: TrapContext) {
        // A reservation never survives a privilege or virtualization
        // transition.
        self.hart.reservation.clear();

        if matches!(ctx.cause, Trap::Exception(Exception::Semihost)) {
            if let Some(mut handler) = self.semihost.take() {
                handler(&mut self.hart);
                self.semihost = Some(handler);
                return;
            }
            // No semihosting host: the magic EBREAK is an ordinary
            // breakpoint.
            return self.take_trap(TrapContext {
                cause: Trap::Exception(Exception::Breakpoint),
                tval: self.hart.pc,
                ..ctx
            });
        }

        let hart = &mut self.hart;
        let is_async = ctx.cause.is_interrupt();
        let mut cause = ctx.cause.code();
        let mut virt = hart.virt_enabled;
        let mut write_gva = false;
        let mut tval = 0u64;
        let mut tinst = 0u64;

        if let Trap::Exception(e) = ctx.cause {
            if e.has_fault_address() {
                write_gva = ctx.two_stage;
                tval = ctx.tval;
                tinst = if ctx.two_stage_indirect {
                    // Standard pseudoinstruction: G-stage fault during a
                    // VS-stage page-table walk.
                    match hart.xlen {
                        Xlen::Rv32 => 0x0000_2000,
                        Xlen::Rv64 => 0x0000_3000,
                    }
                } else {
                    transformed_instruction(hart.xlen, ctx.insn_bits, tval, &hart.gpr)
                };
            } else if matches!(e, Exception::IllegalInstruction | Exception::VirtualInstruction) {
                tval = ctx.insn_bits;
            } else if matches!(e, Exception::Breakpoint) {
                tval = ctx.tval;
            }
        }

        log::debug!(
            "trap: cause {:?} ({cause}) tval {tval:#x} priv {:?} virt {virt} pc {:#x}",
            ctx.cause,
            hart.privilege,
            hart.pc,
        );

        let deleg = if is_async { hart.mideleg } else { hart.medeleg };
        let delegated = hart.privilege <= PrivilegeMode::Supervisor
            && cause < u64::from(hart.xlen.bits())
            && (deleg >> cause) & 1 != 0;

        if delegated {
            // Handle the trap at supervisor level.
            let mut htval = 0u64;
            if hart.has_ext(IsaExtensions::RVH) {
                let hdeleg = if is_async { hart.hideleg } else { hart.hedeleg };
                if virt && (hdeleg >> cause) & 1 != 0 {
                    // The hypervisor delegated it onwards: stay in VS mode.
                    // VS interrupt lines appear under their supervisor
                    // numbers inside the guest.
                    if is_async
                        && matches!(
                            Interrupt::from_code(cause),
                            Some(Interrupt::VirtualSupervisorSoftware)
                                | Some(Interrupt::VirtualSupervisorTimer)
                                | Some(Interrupt::VirtualSupervisorExternal)
                        )
                    {
                        cause -= 1;
                    }
                    write_gva = false;
                } else if virt {
                    // Leave the guest: trap into HS mode.
                    hart.swap_hypervisor_state();
                    hart.hstatus.set_spvp(u1::new((hart.privilege.code() & 1) as u8));
                    hart.hstatus.set_spv(true);
                    htval = ctx.guest_phys_fault;
                    virt = false;
                } else {
                    hart.hstatus.set_spv(false);
                    htval = ctx.guest_phys_fault;
                }
                hart.hstatus.set_gva(write_gva);
            }

            let mut status = hart.mstatus;
            status.set_spie(status.sie());
            status.set_spp(u1::new((hart.privilege.code() & 1) as u8));
            status.set_sie(false);
            hart.mstatus = status;

            hart.scause = cause | (u64::from(is_async) << (hart.xlen.bits() - 1));
            hart.sepc = hart.pc;
            hart.stval = tval;
            hart.htval = htval;
            hart.htinst = tinst;
            hart.pc = hart.stvec.handler_address(cause, is_async);
            hart.set_mode(PrivilegeMode::Supervisor);
            hart.virt_enabled = virt;
        } else {
            // Handle the trap at machine level.
            let mut mtval2 = 0u64;
            if hart.has_ext(IsaExtensions::RVH) {
                if virt {
                    hart.swap_hypervisor_state();
                }
                let mut status = hart.mstatus;
                status.set_mpv(virt);
                status.set_gva(tval != 0 && write_gva);
                hart.mstatus = status;
                mtval2 = ctx.guest_phys_fault;
                // Machine traps always land with virtualization off.
                virt = false;
            }

            let mut status = hart.mstatus;
            status.set_mpie(status.mie());
            status.set_mpp(u2::new(hart.privilege.code() as u8));
            status.set_mie(false);
            hart.mstatus = status;

            hart.mcause = cause | (u64::from(is_async) << (hart.xlen.bits() - 1));
            hart.mepc = hart.pc;
            hart.mtval = tval;
            hart.mtval2 = mtval2;
            hart.mtinst = tinst;
            hart.pc = hart.mtvec.handler_address(cause, is_async);
            hart.set_mode(PrivilegeMode::Machine);
            hart.virt_enabled = virt;
        }

        self.hart.reservation.clear();
    }

    /// Asks the aggregator for a deliverable interrupt and, if one is
    /// pending, dispatches it. The execution loop calls this before each
    /// instruction.
    pub fn deliver_pending_interrupt(&mut self) -> bool {
        let Some(irq) = self.hart.pending_interrupt() else {
            return false;
        };
        self.take_trap(TrapContext::interrupt(irq));
        true
    }
}

const OPC_LOAD: u64 = 0x03;
const OPC_FP_LOAD: u64 = 0x07;
const OPC_STORE: u64 = 0x23;
const OPC_FP_STORE: u64 = 0x27;
const OPC_ATOMIC: u64 = 0x2f;
const OPC_SYSTEM: u64 = 0x73;

const OPC_LW: u64 = 0x2003;
const OPC_LD: u64 = 0x3003;
const OPC_FLW: u64 = 0x2007;
const OPC_FLD: u64 = 0x3007;
const OPC_SW: u64 = 0x2023;
const OPC_SD: u64 = 0x3023;
const OPC_FSW: u64 = 0x2027;
const OPC_FSD: u64 = 0x3027;

const fn set_rd(insn: u64, rd: u64) -> u64 {
    (insn & !(0x1f << 7)) | ((rd & 0x1f) << 7)
}

const fn set_rs1(insn: u64, rs1: u64) -> u64 {
    (insn & !(0x1f << 15)) | ((rs1 & 0x1f) << 15)
}

const fn set_rs2(insn: u64, rs2: u64) -> u64 {
    (insn & !(0x1f << 20)) | ((rs2 & 0x1f) << 20)
}

const fn set_i_imm(insn: u64, imm: u64) -> u64 {
    (insn & !(0xfff << 20)) | ((imm & 0xfff) << 20)
}

const fn set_s_imm(insn: u64, imm: u64) -> u64 {
    (insn & !((0x7f << 25) | (0x1f << 7))) | ((imm & 0x1f) << 7) | (((imm >> 5) & 0x7f) << 25)
}

// Compressed register and immediate field extraction, quadrants 0 and 2.

const fn c_rs1s(insn: u64) -> u64 {
    8 + ((insn >> 7) & 0x7)
}

const fn c_rs2s(insn: u64) -> u64 {
    8 + ((insn >> 2) & 0x7)
}

const fn c_rd(insn: u64) -> u64 {
    (insn >> 7) & 0x1f
}

const fn c_rs2(insn: u64) -> u64 {
    (insn >> 2) & 0x1f
}

/// How the synthesized instruction encodes the fault offset.
enum OffsetField {
    /// I-type immediate, `rs1` zeroed.
    IType,
    /// S-type immediate, `rs1` zeroed.
    SType,
    /// No immediate field exists (atomics, hypervisor load/store): the
    /// offset, masked to the access size, goes into the `rs1` field.
    Rs1 { access_size: u64 },
}

/// Synthesizes the 32-bit trap-instruction value for a faulting load or
/// store.
///
/// Compressed quadrant-0/2 forms widen into their 32-bit equivalents with
/// bit 1 cleared; quadrant 1 holds no load/store encodings and no other
/// opcode produces a value. The source-register and immediate fields are
/// replaced by the byte offset between the faulting address and the base
/// register's value at fault time.
pub fn transformed_instruction(xlen: Xlen, insn: u64, fault_addr: u64, gpr: &[u64; 32]) -> u64 {
    let insn = insn & 0xffff_ffff;
    let rv32 = matches!(xlen, Xlen::Rv32);
    let mut xinsn = 0u64;
    let mut base_reg = 0u64;
    let mut field = OffsetField::IType;

    if insn & 0x3 != 0x3 {
        // 16-bit encoding; funct is bits [15:13], quadrant bits [1:0].
        let funct = (insn >> 13) & 0x7;
        match insn & 0x3 {
            0b00 => match funct {
                0b001 => {
                    // C.FLD
                    xinsn = set_rd(OPC_FLD, c_rs2s(insn));
                    base_reg = c_rs1s(insn);
                }
                0b010 => {
                    // C.LW
                    xinsn = set_rd(OPC_LW, c_rs2s(insn));
                    base_reg = c_rs1s(insn);
                }
                0b011 => {
                    if rv32 {
                        // C.FLW
                        xinsn = set_rd(OPC_FLW, c_rs2s(insn));
                    } else {
                        // C.LD
                        xinsn = set_rd(OPC_LD, c_rs2s(insn));
                    }
                    base_reg = c_rs1s(insn);
                }
                0b101 => {
                    // C.FSD
                    xinsn = set_rs2(OPC_FSD, c_rs2s(insn));
                    base_reg = c_rs1s(insn);
                    field = OffsetField::SType;
                }
                0b110 => {
                    // C.SW
                    xinsn = set_rs2(OPC_SW, c_rs2s(insn));
                    base_reg = c_rs1s(insn);
                    field = OffsetField::SType;
                }
                0b111 => {
                    if rv32 {
                        // C.FSW
                        xinsn = set_rs2(OPC_FSW, c_rs2s(insn));
                    } else {
                        // C.SD
                        xinsn = set_rs2(OPC_SD, c_rs2s(insn));
                    }
                    base_reg = c_rs1s(insn);
                    field = OffsetField::SType;
                }
                _ => {}
            },
            0b10 => {
                // Stack-pointer relative forms.
                const SP: u64 = 2;
                match funct {
                    0b001 => {
                        // C.FLDSP
                        xinsn = set_rd(OPC_FLD, c_rd(insn));
                        base_reg = SP;
                    }
                    0b010 => {
                        // C.LWSP
                        xinsn = set_rd(OPC_LW, c_rd(insn));
                        base_reg = SP;
                    }
                    0b011 => {
                        if rv32 {
                            // C.FLWSP
                            xinsn = set_rd(OPC_FLW, c_rd(insn));
                        } else {
                            // C.LDSP
                            xinsn = set_rd(OPC_LD, c_rd(insn));
                        }
                        base_reg = SP;
                    }
                    0b101 => {
                        // C.FSDSP
                        xinsn = set_rs2(OPC_FSD, c_rs2(insn));
                        base_reg = SP;
                        field = OffsetField::SType;
                    }
                    0b110 => {
                        // C.SWSP
                        xinsn = set_rs2(OPC_SW, c_rs2(insn));
                        base_reg = SP;
                        field = OffsetField::SType;
                    }
                    0b111 => {
                        if rv32 {
                            // C.FSWSP
                            xinsn = set_rs2(OPC_FSW, c_rs2(insn));
                        } else {
                            // C.SDSP
                            xinsn = set_rs2(OPC_SD, c_rs2(insn));
                        }
                        base_reg = SP;
                        field = OffsetField::SType;
                    }
                    _ => {}
                }
            }
            // Quadrant 1 never generates load/store traps.
            _ => {}
        }
        if xinsn != 0 {
            // Bit 1 cleared marks a transform of a compressed form.
            xinsn &= !0x2;
        }
    } else {
        match insn & 0x7f {
            OPC_LOAD | OPC_FP_LOAD => {
                xinsn = insn;
                base_reg = (insn >> 15) & 0x1f;
            }
            OPC_STORE | OPC_FP_STORE => {
                xinsn = insn;
                base_reg = (insn >> 15) & 0x1f;
                field = OffsetField::SType;
            }
            OPC_ATOMIC => {
                xinsn = insn;
                base_reg = (insn >> 15) & 0x1f;
                field = OffsetField::Rs1 {
                    access_size: 1 << ((insn >> 12) & 0x7),
                };
            }
            OPC_SYSTEM => {
                let funct3 = (insn >> 12) & 0x7;
                let funct7 = (insn >> 25) & 0x7f;
                if funct3 == 0b100 && (funct7 >> 3) == 0b0110 {
                    // Hypervisor virtual-machine load/store.
                    xinsn = insn;
                    base_reg = (insn >> 15) & 0x1f;
                    field = OffsetField::Rs1 {
                        access_size: 1 << ((funct7 >> 1) & 0x3),
                    };
                }
            }
            _ => {}
        }
    }

    if xinsn == 0 {
        return 0;
    }

    let offset = fault_addr.wrapping_sub(gpr[base_reg as usize]);
    match field {
        OffsetField::IType => set_i_imm(set_rs1(xinsn, 0), offset),
        OffsetField::SType => set_s_imm(set_rs1(xinsn, 0), offset),
        OffsetField::Rs1 { access_size } => set_rs1(xinsn, offset & (access_size - 1)),
    }
}

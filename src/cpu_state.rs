// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Hart (hardware thread) state: privilege mode, register file, capability
//! flags.

use std::cell::Cell;

mod csrs;
mod reservation;

pub use csrs::*;
pub use reservation::*;

use crate::{interrupts::Interrupt, memory::Pmp};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
/// Privilege mode of a hart. Whether the hart is additionally executing as a
/// guest is tracked separately in [`HartState::virt_enabled`].
pub enum PrivilegeMode {
    User = 0,
    Supervisor = 1,
    #[default]
    Machine = 3,
}

impl PrivilegeMode {
    /// The architectural encoding, as stored in `mstatus.MPP`.
    #[inline]
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Decodes an architectural privilege encoding.
    ///
    /// Encoding `0b10` is reserved; CSR write legalization keeps it out of
    /// `MPP`/`SPP`, so hitting it here is a host bug.
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => Self::User,
            1 => Self::Supervisor,
            3 => Self::Machine,
            other => unreachable!("reserved privilege encoding {other:#b}"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
/// Base register width of the hart.
pub enum Xlen {
    Rv32,
    #[default]
    Rv64,
}

impl Xlen {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Rv32 => 32,
            Self::Rv64 => 64,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    /// Optional architectural capabilities of the hart.
    pub struct IsaExtensions: u64 {
        /// Hypervisor extension: two-stage translation, VS/HS modes.
        const RVH = 0b00000001;
        /// NAPOT contiguous leaf page-table entries.
        const SVNAPOT = 0b00000010;
        /// Page-based memory type attributes in leaf entries.
        const SVPBMT = 0b00000100;
        /// Hardware update of the accessed/dirty bits. Without it, an access
        /// needing an update page-faults.
        const SVADU = 0b00001000;
        /// Machine-level advanced interrupt architecture (priority arrays).
        const SMAIA = 0b00010000;
        /// Supervisor-level advanced interrupt architecture.
        const SSAIA = 0b00100000;
        /// Supervisor timer compare registers (`vstimecmp` products).
        const SSTC = 0b01000000;
        /// Physical memory protection unit present.
        const PMP = 0b10000000;
    }
}

impl Default for IsaExtensions {
    fn default() -> Self {
        Self::SVADU | Self::PMP
    }
}

/// Architectural state of one hart, as seen by the translation and trap
/// machinery.
///
/// The supervisor registers (`stvec`, `sepc`, ... , `satp`) always hold the
/// *active* view: while [`Self::virt_enabled`] is set they contain the
/// guest's VS values and the `vs*` fields hold the host's, and
/// [`Self::swap_hypervisor_state`] exchanges the two on virtualization
/// transitions.
#[derive(Debug)]
pub struct HartState {
    pub xlen: Xlen,
    pub extensions: IsaExtensions,
    pub gpr: [u64; 32],
    pub pc: u64,
    /// Bits of the instruction being executed, maintained by the execution
    /// loop for trap-instruction synthesis.
    pub bins: u64,
    pub privilege: PrivilegeMode,
    pub virt_enabled: bool,

    pub mstatus: Mstatus,
    pub mtvec: TrapVector,
    pub medeleg: u64,
    pub mideleg: u64,
    pub mie: u64,
    pub mip: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    pub mtval2: u64,
    pub mtinst: u64,
    pub mscratch: u64,
    pub mcounteren: u32,

    pub stvec: TrapVector,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub sscratch: u64,
    pub satp: u64,
    pub scounteren: u32,

    pub hstatus: Hstatus,
    pub hedeleg: u64,
    pub hideleg: u64,
    pub hgatp: u64,
    pub htval: u64,
    pub htinst: u64,
    pub hgeie: u64,
    pub hgeip: u64,
    pub htimedelta: u64,
    pub hcounteren: u32,

    pub vsstatus: Mstatus,
    pub vstvec: TrapVector,
    pub vsepc: u64,
    pub vscause: u64,
    pub vstval: u64,
    pub vsscratch: u64,
    pub vsatp: u64,
    /// Sstc product: the virtual supervisor timer comparator has fired.
    pub vstime_irq: bool,

    /// Per-IRQ priority, machine view. `0` selects the architectural
    /// default.
    pub miprio: [u8; 64],
    /// Per-IRQ priority, supervisor view.
    pub siprio: [u8; 64],
    /// Per-IRQ priority, virtual supervisor view.
    pub hviprio: [u8; 64],

    pub pmp: Pmp,
    pub reservation: LoadReservation,
    pub(crate) irq_claim: Cell<Option<Interrupt>>,
}

impl HartState {
    pub fn new(xlen: Xlen, extensions: IsaExtensions) -> Self {
        Self {
            xlen,
            extensions,
            gpr: [0; 32],
            pc: 0,
            bins: 0,
            privilege: PrivilegeMode::Machine,
            virt_enabled: false,
            mstatus: Mstatus::default(),
            mtvec: TrapVector::default(),
            medeleg: 0,
            mideleg: 0,
            mie: 0,
            mip: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            mtval2: 0,
            mtinst: 0,
            mscratch: 0,
            mcounteren: 0,
            stvec: TrapVector::default(),
            sepc: 0,
            scause: 0,
            stval: 0,
            sscratch: 0,
            satp: 0,
            scounteren: 0,
            hstatus: Hstatus::default(),
            hedeleg: 0,
            hideleg: 0,
            hgatp: 0,
            htval: 0,
            htinst: 0,
            hgeie: 0,
            hgeip: 0,
            htimedelta: 0,
            hcounteren: 0,
            vsstatus: Mstatus::default(),
            vstvec: TrapVector::default(),
            vsepc: 0,
            vscause: 0,
            vstval: 0,
            vsscratch: 0,
            vsatp: 0,
            vstime_irq: false,
            miprio: [0; 64],
            siprio: [0; 64],
            hviprio: [0; 64],
            pmp: Pmp::default(),
            reservation: LoadReservation::default(),
            irq_claim: Cell::new(None),
        }
    }

    #[inline]
    pub fn has_ext(&self, ext: IsaExtensions) -> bool {
        self.extensions.contains(ext)
    }

    /// Changes the privilege mode, as the trap dispatcher and the xRET
    /// instructions (external) do.
    pub fn set_mode(&mut self, privilege: PrivilegeMode) {
        if privilege != self.privilege {
            log::trace!("privilege {:?} -> {:?}", self.privilege, privilege);
        }
        self.privilege = privilege;
    }

    /// Exchanges the active and background supervisor register views.
    ///
    /// Called whenever `virt_enabled` is about to toggle: the `sstatus`
    /// subset named by [`Mstatus::SWAP_MASK`] moves between `mstatus` and
    /// `vsstatus`, and the paired supervisor CSRs swap with their `vs*`
    /// counterparts.
    pub fn swap_hypervisor_state(&mut self) {
        debug_assert!(self.has_ext(IsaExtensions::RVH));
        let mask = Mstatus::SWAP_MASK;
        let mstatus = u64::from(self.mstatus);
        let vsstatus = u64::from(self.vsstatus);
        self.mstatus = Mstatus::from((mstatus & !mask) | (vsstatus & mask));
        self.vsstatus = Mstatus::from((vsstatus & !mask) | (mstatus & mask));
        std::mem::swap(&mut self.stvec, &mut self.vstvec);
        std::mem::swap(&mut self.sscratch, &mut self.vsscratch);
        std::mem::swap(&mut self.sepc, &mut self.vsepc);
        std::mem::swap(&mut self.scause, &mut self.vscause);
        std::mem::swap(&mut self.stval, &mut self.vstval);
        std::mem::swap(&mut self.satp, &mut self.vsatp);
    }
}

impl Default for HartState {
    fn default() -> Self {
        Self::new(Xlen::default(), IsaExtensions::default())
    }
}

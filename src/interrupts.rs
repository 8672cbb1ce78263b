// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Interrupt aggregation.
//!
//! Computes, from the pending/enabled/delegation bitmasks and the priority
//! tables, the single highest-priority interrupt visible at a given level.
//! These queries never clear pending state; the winner of a full query is
//! only latched for a subsequent claim/complete protocol.

use crate::cpu_state::{HartState, IsaExtensions, PrivilegeMode};

pub const MIP_SSIP: u64 = 1 << 1;
pub const MIP_VSSIP: u64 = 1 << 2;
pub const MIP_MSIP: u64 = 1 << 3;
pub const MIP_STIP: u64 = 1 << 5;
pub const MIP_VSTIP: u64 = 1 << 6;
pub const MIP_MTIP: u64 = 1 << 7;
pub const MIP_SEIP: u64 = 1 << 9;
pub const MIP_VSEIP: u64 = 1 << 10;
pub const MIP_MEIP: u64 = 1 << 11;
pub const MIP_SGEIP: u64 = 1 << 12;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
/// Standard local interrupt lines.
pub enum Interrupt {
    SupervisorSoftware = 1,
    VirtualSupervisorSoftware = 2,
    MachineSoftware = 3,
    SupervisorTimer = 5,
    VirtualSupervisorTimer = 6,
    MachineTimer = 7,
    SupervisorExternal = 9,
    VirtualSupervisorExternal = 10,
    MachineExternal = 11,
    SupervisorGuestExternal = 12,
}

impl Interrupt {
    #[inline]
    pub const fn code(self) -> u64 {
        self as u64
    }

    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => Self::SupervisorSoftware,
            2 => Self::VirtualSupervisorSoftware,
            3 => Self::MachineSoftware,
            5 => Self::SupervisorTimer,
            6 => Self::VirtualSupervisorTimer,
            7 => Self::MachineTimer,
            9 => Self::SupervisorExternal,
            10 => Self::VirtualSupervisorExternal,
            11 => Self::MachineExternal,
            12 => Self::SupervisorGuestExternal,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// Which delegation level an aggregation query looks at.
pub enum InterruptClass {
    Machine,
    HypervisorSupervisor,
    VirtualSupervisor,
}

/// Default priority order of the local interrupt lines, highest first, as
/// the advanced interrupt architecture defines it: the upper custom group,
/// then the M/S/SGE/VS groups, then the lower custom group.
const DEFAULT_PRIORITY: [u8; 64] = {
    const ORDER: [usize; 34] = [
        47, 23, 46, 45, 22, 44, 43, 21, 42, 41, 20, 40, // upper custom
        11, 3, 7, // machine external, software, timer
        9, 1, 5, // supervisor external, software, timer
        12, // supervisor guest external
        10, 2, 6, // virtual supervisor external, software, timer
        39, 19, 38, 37, 18, 36, 35, 17, 34, 33, 16, 32, // lower custom
    ];
    let mut table = [u8::MAX; 64];
    let mut i = 0;
    while i < ORDER.len() {
        table[ORDER[i]] = 3 + i as u8;
        i += 1;
    }
    table
};

/// Architectural default priority of an interrupt line. Lower is more
/// urgent; out-of-range lines get the lowest priority.
pub const fn default_priority(irq: u64) -> u8 {
    if irq < 64 {
        DEFAULT_PRIORITY[irq as usize]
    } else {
        u8::MAX
    }
}

/// Picks the winner out of a pending set.
///
/// Without the advanced interrupt architecture the lowest line number wins.
/// With it, the lowest effective priority wins: the configured value, or the
/// architectural default where the configuration holds zero; ties fall back
/// to the architectural default order.
fn pending_to_irq(irqs: u64, aia: bool, iprio: &[u8; 64]) -> Option<u64> {
    if irqs == 0 {
        return None;
    }
    if !aia {
        return Some(u64::from(irqs.trailing_zeros()));
    }
    let mut best: Option<(u8, u8, u64)> = None;
    let mut remaining = irqs;
    while remaining != 0 {
        let irq = u64::from(remaining.trailing_zeros());
        remaining &= remaining - 1;
        let configured = iprio[irq as usize];
        let effective = if configured != 0 {
            configured
        } else {
            default_priority(irq)
        };
        let key = (effective, default_priority(irq), irq);
        if best.map_or(true, |b| key < b) {
            best = Some(key);
        }
    }
    best.map(|(_, _, irq)| irq)
}

impl HartState {
    /// All pending-and-enabled interrupt lines: the architectural `mip`
    /// bits plus the derived sources (the guest external line selected by
    /// `hstatus.VGEIN`, any raised guest external line, and the virtual
    /// supervisor timer comparator), masked by `mie`.
    pub fn all_pending(&self) -> u64 {
        let gein = u64::from(u8::from(self.hstatus.vgein()));
        let vsgein = if gein != 0 && (self.hgeip >> gein) & 1 != 0 {
            MIP_VSEIP
        } else {
            0
        };
        let vstip = if self.vstime_irq { MIP_VSTIP } else { 0 };
        let sgeip = if self.hgeip & self.hgeie != 0 {
            MIP_SGEIP
        } else {
            0
        };
        (self.mip | vsgein | vstip | sgeip) & self.mie
    }

    /// Pending lines visible to `class` after delegation filtering. The
    /// virtual-supervisor view is renumbered down by one line.
    fn pending_for(&self, class: InterruptClass) -> u64 {
        let pending = self.all_pending();
        match class {
            InterruptClass::Machine => pending & !self.mideleg,
            InterruptClass::HypervisorSupervisor => pending & self.mideleg & !self.hideleg,
            InterruptClass::VirtualSupervisor => (pending & self.mideleg & self.hideleg) >> 1,
        }
    }

    /// The highest-priority interrupt pending for `class`, ignoring the
    /// global enable bits. Read-only: repeated queries over unchanged state
    /// return the same answer.
    pub fn highest_pending(&self, class: InterruptClass) -> Option<Interrupt> {
        let irqs = self.pending_for(class);
        let (aia, iprio) = match class {
            InterruptClass::Machine => (self.has_ext(IsaExtensions::SMAIA), &self.miprio),
            InterruptClass::HypervisorSupervisor => {
                (self.has_ext(IsaExtensions::SSAIA), &self.siprio)
            }
            InterruptClass::VirtualSupervisor => (self.has_ext(IsaExtensions::SSAIA), &self.hviprio),
        };
        let irq = pending_to_irq(irqs, aia, iprio)?;
        let irq = if class == InterruptClass::VirtualSupervisor {
            // Undo the VS-view renumbering.
            irq + 1
        } else {
            irq
        };
        Interrupt::from_code(irq)
    }

    /// The interrupt the hart should take right now, honoring the global
    /// enables of every privilege level: machine first, then HS, then VS.
    ///
    /// The winner is latched as the claim value for a later claim/complete
    /// step; pending bits are left untouched.
    pub fn pending_interrupt(&self) -> Option<Interrupt> {
        let (mie, hsie, vsie) = if self.virt_enabled {
            // From a guest, the host levels are always interruptible; the
            // guest's own SIE lives in the active mstatus view.
            let vsie = self.privilege < PrivilegeMode::Supervisor
                || (self.privilege == PrivilegeMode::Supervisor && self.mstatus.sie());
            (true, true, vsie)
        } else {
            let mie = self.privilege < PrivilegeMode::Machine
                || (self.privilege == PrivilegeMode::Machine && self.mstatus.mie());
            let hsie = self.privilege < PrivilegeMode::Supervisor
                || (self.privilege == PrivilegeMode::Supervisor && self.mstatus.sie());
            (mie, hsie, false)
        };

        let classes = [
            (InterruptClass::Machine, mie),
            (InterruptClass::HypervisorSupervisor, hsie),
            (InterruptClass::VirtualSupervisor, vsie),
        ];
        for (class, enabled) in classes {
            if !enabled {
                continue;
            }
            if let Some(irq) = self.highest_pending(class) {
                self.irq_claim.set(Some(irq));
                return Some(irq);
            }
        }
        None
    }

    /// The interrupt latched by the last successful [`Self::pending_interrupt`]
    /// query.
    pub fn claimed_interrupt(&self) -> Option<Interrupt> {
        self.irq_claim.get()
    }
}

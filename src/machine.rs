// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Representation of an emulated machine: one hart, its physical memory
//! map, and the translation cache, plus the fill coordinator tying the
//! walker, the PMP authority and the trap dispatcher together.

pub mod pagewalk;

use crate::{
    cpu_state::{HartState, IsaExtensions, PrivilegeMode},
    exceptions::{Exception, Trap, TrapContext},
    memory::{
        AccessType, Address, BusError, FaultKind, MemoryMap, MmuFault, PmpCheck, Tlb, TlbEntry,
        Translation, VirtualMemoryMode, Width, PAGE_SHIFT, PAGE_SIZE,
    },
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// The register-set context a memory access executes under.
///
/// Usually derived from the current privilege state by
/// [`RiscvMachine::effective_access`]; the hypervisor virtual-machine
/// load/store instructions construct one explicitly to reach VS-context
/// memory from HS or M mode.
pub struct AccessContext {
    pub mode: PrivilegeMode,
    /// Translate through the guest's address spaces (two-stage).
    pub virt: bool,
}

/// The state of the emulated machine.
pub struct RiscvMachine {
    pub hart: HartState,
    pub memory: MemoryMap,
    pub tlb: Tlb,
    /// Host semihosting interface. When present, claims
    /// [`Exception::Semihost`] causes before any delegation logic runs.
    pub semihost: Option<Box<dyn FnMut(&mut HartState) + Send>>,
}

impl RiscvMachine {
    pub fn new(memory: MemoryMap) -> Self {
        Self {
            hart: HartState::default(),
            memory,
            tlb: Tlb::new(),
            semihost: None,
        }
    }

    /// Performs a physical bus read.
    pub fn read_phys(&self, address: Address, width: Width) -> Result<u64, BusError> {
        self.memory.read(address, width)
    }

    /// Performs a physical bus write.
    pub fn write_phys(&mut self, address: Address, value: u64, width: Width) -> Result<(), BusError> {
        self.memory.write(address, value, width)
    }

    /// Evaluates the PMP authority, granting everything when the hart has no
    /// PMP unit.
    pub fn pmp_check(&self, address: Address, size: u64, mode: PrivilegeMode) -> PmpCheck {
        if !self.hart.has_ext(IsaExtensions::PMP) {
            return PmpCheck::unrestricted();
        }
        self.hart.pmp.check(address, size, mode)
    }

    /// Derives the privilege and virtualization context of an access from
    /// the current hart state: `mstatus.MPRV` redirects loads and stores to
    /// the previous privilege, and `MPV` additionally selects the guest
    /// address spaces. Instruction fetches ignore both.
    pub fn effective_access(&self, access: AccessType) -> AccessContext {
        let hart = &self.hart;
        let mut mode = hart.privilege;
        let mut virt = hart.virt_enabled;
        if access != AccessType::Fetch && hart.mstatus.mprv() {
            mode = hart.mstatus.mpp_mode();
            if hart.has_ext(IsaExtensions::RVH)
                && hart.mstatus.mpv()
                && mode != PrivilegeMode::Machine
            {
                virt = true;
            }
        }
        AccessContext { mode, virt }
    }

    /// Resolves `address` to a host-physical translation under `ctx`,
    /// composing both stages when the context is virtualized and
    /// intersecting with the PMP authority.
    fn resolve(
        &self,
        address: Address,
        size: u64,
        access: AccessType,
        ctx: AccessContext,
        is_debug: bool,
    ) -> Result<(Translation, u16), MmuFault> {
        let two_stage = ctx.virt;
        let translation = if two_stage {
            let first = self.translate(address, access, ctx.mode, true, true, is_debug)?;
            let intermediate = first.physical;
            match self.translate_guest_stage(intermediate, access, is_debug) {
                Ok(second) => Translation {
                    physical: second.physical,
                    prot: first.prot & second.prot,
                    page_size: first.page_size.min(second.page_size),
                    global: first.global,
                    asid: first.asid,
                },
                Err(fault) => {
                    // A failed G-stage on the final address is a guest-page
                    // fault against the intermediate address; bus and PMP
                    // refusals keep their own class.
                    let kind = match fault.kind {
                        FaultKind::PageFault | FaultKind::GuestPageFault => {
                            FaultKind::GuestPageFault
                        }
                        other => other,
                    };
                    let guest_phys_fault = (kind == FaultKind::GuestPageFault)
                        .then(|| (intermediate.0 | address.offset_in(PAGE_SIZE)) >> 2);
                    return Err(MmuFault {
                        kind,
                        guest_phys_fault,
                        two_stage_indirect: false,
                    });
                }
            }
        } else {
            self.translate(address, access, ctx.mode, false, false, is_debug)?
        };

        let pmp = self.pmp_check(translation.physical, size, ctx.mode);
        if !pmp.prot.contains(access.required_prot()) {
            return Err(MmuFault::new(FaultKind::PmpFail));
        }
        let vmid = if two_stage {
            VirtualMemoryMode::from_hgatp(self.hart.hgatp, self.hart.xlen).asid
        } else {
            0
        };
        Ok((
            Translation {
                prot: translation.prot & pmp.prot,
                page_size: translation.page_size.min(pmp.page_size_cap),
                ..translation
            },
            vmid,
        ))
    }

    /// Translates an access and installs the result into the TLB.
    ///
    /// Returns `true` when a translation was installed (or, under `probe`,
    /// exists). On failure, `probe` returns `false` silently; otherwise the
    /// typed fault is handed to the trap dispatcher and control continues at
    /// the selected handler.
    pub fn fill(&mut self, address: Address, size: u64, access: AccessType, probe: bool) -> bool {
        let ctx = self.effective_access(access);
        self.fill_with(address, size, access, ctx, probe)
    }

    /// [`Self::fill`] under an explicit register-set context.
    pub fn fill_with(
        &mut self,
        address: Address,
        size: u64,
        access: AccessType,
        ctx: AccessContext,
        probe: bool,
    ) -> bool {
        match self.resolve(address, size, access, ctx, false) {
            Ok((translation, vmid)) => {
                if translation.page_size >= PAGE_SIZE {
                    let entry = TlbEntry {
                        ppn: translation.physical.0 >> PAGE_SHIFT,
                        prot: translation.prot,
                        page_size: translation.page_size,
                    };
                    self.tlb
                        .insert(translation.global, translation.asid, vmid, address.0, entry);
                } else {
                    // A PMP rule splits the page; permissions cannot be
                    // cached without over-extending them.
                    log::trace!("fill: translation for {address} below page granularity, not cached");
                }
                true
            }
            Err(fault) => {
                if probe {
                    return false;
                }
                let cause = Self::fault_exception(fault.kind, access);
                self.take_trap(TrapContext {
                    cause: Trap::Exception(cause),
                    tval: address.0,
                    insn_bits: self.hart.bins,
                    guest_phys_fault: fault.guest_phys_fault.unwrap_or(0),
                    two_stage: ctx.virt,
                    two_stage_indirect: fault.two_stage_indirect,
                });
                false
            }
        }
    }

    /// Debug/monitor translation: no faults, no side effects.
    pub fn debug_translate(&self, address: Address) -> Option<Address> {
        let ctx = self.effective_access(AccessType::Load);
        self.resolve(address, 1, AccessType::Load, ctx, true)
            .ok()
            .map(|(translation, _)| translation.physical)
    }

    fn fault_exception(kind: FaultKind, access: AccessType) -> Exception {
        match (kind, access) {
            (FaultKind::PageFault, AccessType::Fetch) => Exception::InstructionPageFault,
            (FaultKind::PageFault, AccessType::Load) => Exception::LoadPageFault,
            (FaultKind::PageFault, AccessType::Store) => Exception::StorePageFault,
            (FaultKind::GuestPageFault, AccessType::Fetch) => Exception::InstructionGuestPageFault,
            (FaultKind::GuestPageFault, AccessType::Load) => Exception::LoadGuestPageFault,
            (FaultKind::GuestPageFault, AccessType::Store) => Exception::StoreGuestPageFault,
            (FaultKind::AccessFault | FaultKind::PmpFail, AccessType::Fetch) => {
                Exception::InstructionAccessFault
            }
            (FaultKind::AccessFault | FaultKind::PmpFail, AccessType::Load) => {
                Exception::LoadAccessFault
            }
            (FaultKind::AccessFault | FaultKind::PmpFail, AccessType::Store) => {
                Exception::StoreAmoAccessFault
            }
        }
    }
}

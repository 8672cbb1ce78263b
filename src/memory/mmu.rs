// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! MMU - Address Translation
//!
//! The page-table walker behind every guest memory access: decodes the
//! active address-space mode out of `satp`/`vsatp`/`hgatp`, walks the table
//! levels through the physical bus, performs the permission and
//! accessed/dirty disciplines, and composes the resulting physical address.
//!
//! Two walk flavors exist, kept apart by the [`StageOps`] implementations:
//! the first stage (guest-virtual input, possibly with its table entries
//! living in guest-physical space that itself needs G-stage translation) and
//! the G-stage (guest-physical input, widened root, user-page policy).

use bilge::prelude::*;

use crate::{
    cpu_state::{Hgatp, Hgatp32, HartState, IsaExtensions, PrivilegeMode, Satp, Satp32, Xlen},
    machine::RiscvMachine,
    memory::{Address, Width},
};

/// Base page granule.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Bound on accessed/dirty compare-and-swap retries. Contention on one entry
/// from a finite number of harts resolves in a handful of rounds; hitting
/// the bound indicates a host bug.
const AD_UPDATE_RETRIES: u32 = 16;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    /// Page protection bits.
    pub struct Prot: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const EXEC  = 0b100;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// Kind of a guest memory access.
///
/// A closed set: translation, PMP evaluation and trap synthesis all match on
/// it exhaustively, so a new access kind fails to compile until every
/// consumer handles it.
pub enum AccessType {
    Load,
    Store,
    Fetch,
}

impl AccessType {
    /// The permission an access of this kind needs, before MXR adjustment.
    pub const fn required_prot(self) -> Prot {
        match self {
            Self::Load => Prot::READ,
            Self::Store => Prot::WRITE,
            Self::Fetch => Prot::EXEC,
        }
    }
}

#[bitsize(64)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// A page-table entry. The Sv32 4-byte form zero-extends into the same
/// layout: flag bits coincide and the high attribute bits read as zero.
pub struct Pte {
    pub v: bool,
    pub r: bool,
    pub w: bool,
    pub x: bool,
    pub u: bool,
    pub g: bool,
    pub a: bool,
    pub d: bool,
    /// Reserved for software. (bits `[9:8]`)
    pub rsw: u2,
    /// Physical page number. (bits `[53:10]`)
    pub ppn: u44,
    /// Reserved, must be zero. (bits `[60:54]`)
    pub reserved: u7,
    /// Svpbmt memory type. (bits `[62:61]`)
    pub pbmt: u2,
    /// Svnapot contiguous-range leaf. (bit `[63]`)
    pub n: bool,
}

impl Pte {
    /// A valid entry with none of R/W/X is a pointer to the next level.
    pub fn is_leaf(&self) -> bool {
        self.r() || self.w() || self.x()
    }

    /// Leaf-only bits that must be clear on a non-leaf entry.
    fn has_leaf_only_bits(&self) -> bool {
        self.a() || self.d() || self.u() || u8::from(self.pbmt()) != 0 || self.n()
    }

    /// Protection bits this leaf grants, with MXR folding execute into read.
    fn leaf_prot(&self, mxr: bool) -> Prot {
        let mut prot = Prot::empty();
        if self.r() || (mxr && self.x()) {
            prot |= Prot::READ;
        }
        if self.w() {
            prot |= Prot::WRITE;
        }
        if self.x() {
            prot |= Prot::EXEC;
        }
        prot
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// Paged translation schemes.
pub enum TranslationScheme {
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
}

#[derive(Copy, Clone, Debug)]
/// A decoded address-space mode: everything the walker needs to know about
/// one translation stage's table geometry.
pub struct VirtualMemoryMode {
    pub scheme: TranslationScheme,
    /// Root table base address.
    pub root: Address,
    pub levels: u32,
    pub index_bits: u32,
    pub pte_size: u64,
    /// Input-address widening: 2 for the G-stage (quadrupled root table),
    /// else 0.
    pub widened: u32,
    pub asid: u16,
}

impl VirtualMemoryMode {
    /// Decodes a first-stage base register (`satp` or `vsatp`).
    ///
    /// An unrecognized mode value cannot come from a legalized CSR write;
    /// reaching it is a host bug, not a guest-visible fault.
    pub fn from_satp(raw: u64, xlen: Xlen) -> Self {
        match xlen {
            Xlen::Rv32 => {
                let satp = Satp32::from(raw as u32);
                let (scheme, levels, index_bits) = match u8::from(satp.mode()) {
                    0 => (TranslationScheme::Bare, 0, 0),
                    1 => (TranslationScheme::Sv32, 2, 10),
                    _ => unreachable!(),
                };
                Self {
                    scheme,
                    root: Address(u64::from(u32::from(satp.ppn())) << PAGE_SHIFT),
                    levels,
                    index_bits,
                    pte_size: 4,
                    widened: 0,
                    asid: u16::from(satp.asid()),
                }
            }
            Xlen::Rv64 => {
                let satp = Satp::from(raw);
                let (scheme, levels) = match u8::from(satp.mode()) {
                    0 => (TranslationScheme::Bare, 0),
                    8 => (TranslationScheme::Sv39, 3),
                    9 => (TranslationScheme::Sv48, 4),
                    10 => (TranslationScheme::Sv57, 5),
                    other => unreachable!("reserved satp mode {other}"),
                };
                Self {
                    scheme,
                    root: Address(u64::from(satp.ppn()) << PAGE_SHIFT),
                    levels,
                    index_bits: 9,
                    pte_size: 8,
                    widened: 0,
                    asid: satp.asid(),
                }
            }
        }
    }

    /// Decodes the G-stage base register (`hgatp`).
    pub fn from_hgatp(raw: u64, xlen: Xlen) -> Self {
        match xlen {
            Xlen::Rv32 => {
                let hgatp = Hgatp32::from(raw as u32);
                let (scheme, levels, index_bits) = match u8::from(hgatp.mode()) {
                    0 => (TranslationScheme::Bare, 0, 0),
                    1 => (TranslationScheme::Sv32, 2, 10),
                    _ => unreachable!(),
                };
                Self {
                    scheme,
                    root: Address(u64::from(u32::from(hgatp.ppn())) << PAGE_SHIFT),
                    levels,
                    index_bits,
                    pte_size: 4,
                    widened: 2,
                    asid: u16::from(u8::from(hgatp.vmid())),
                }
            }
            Xlen::Rv64 => {
                let hgatp = Hgatp::from(raw);
                let (scheme, levels) = match u8::from(hgatp.mode()) {
                    0 => (TranslationScheme::Bare, 0),
                    8 => (TranslationScheme::Sv39, 3),
                    9 => (TranslationScheme::Sv48, 4),
                    10 => (TranslationScheme::Sv57, 5),
                    other => unreachable!("reserved hgatp mode {other}"),
                };
                Self {
                    scheme,
                    root: Address(u64::from(hgatp.ppn()) << PAGE_SHIFT),
                    levels,
                    index_bits: 9,
                    pte_size: 8,
                    widened: 2,
                    asid: u16::from(hgatp.vmid()),
                }
            }
        }
    }

    #[inline]
    pub fn is_bare(&self) -> bool {
        matches!(self.scheme, TranslationScheme::Bare)
    }

    /// Number of meaningful input-address bits.
    pub fn va_bits(&self) -> u32 {
        PAGE_SHIFT + self.levels * self.index_bits + self.widened
    }

    /// Checks the unused high input-address bits. First-stage addresses must
    /// be sign-extended from bit `va_bits - 1`; the widened G-stage input
    /// must be zero above `va_bits`.
    pub fn address_in_range(&self, address: u64, xlen: Xlen) -> bool {
        let va_bits = self.va_bits();
        if va_bits >= 64 {
            return true;
        }
        if self.widened != 0 {
            return (address >> va_bits) == 0;
        }
        if matches!(xlen, Xlen::Rv32) {
            // Sv32 inputs cover the whole 32-bit space.
            return true;
        }
        let mask = u64::MAX << (va_bits - 1);
        let msbs = address & mask;
        msbs == 0 || msbs == mask
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// Classification of a failed translation.
pub enum FaultKind {
    /// First-stage page fault at the input address.
    PageFault,
    /// G-stage fault; `MmuFault::guest_phys_fault` carries the auxiliary
    /// guest-physical value.
    GuestPageFault,
    /// The bus refused a walk transaction, or the input address was not
    /// properly sign-extended.
    AccessFault,
    /// A PMP rule denied the access. Reported as an access fault but kept
    /// apart so callers can tell the reporting paths apart.
    PmpFail,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// A failed translation, before the fill coordinator attaches the faulting
/// input address and dispatches.
pub struct MmuFault {
    pub kind: FaultKind,
    /// For guest-page faults: the guest-physical auxiliary value destined
    /// for `htval`/`mtval2`, already shifted right by two.
    pub guest_phys_fault: Option<u64>,
    /// The fault hit while G-stage translating the address of a VS-stage
    /// page-table entry, not the access itself.
    pub two_stage_indirect: bool,
}

impl MmuFault {
    pub(crate) fn new(kind: FaultKind) -> Self {
        Self {
            kind,
            guest_phys_fault: None,
            two_stage_indirect: false,
        }
    }
}

#[derive(Copy, Clone, Debug)]
/// A successful translation.
pub struct Translation {
    pub physical: Address,
    pub prot: Prot,
    /// Natural size of the translated mapping (superpage/NAPOT aware).
    pub page_size: u64,
    /// Leaf had the global bit; the mapping is valid across ASIDs.
    pub global: bool,
    /// ASID (or VMID, for G-stage results) of the translating table.
    pub asid: u16,
}

impl Translation {
    /// The identity translation used for M-mode and `Bare` address spaces.
    pub(crate) fn identity(address: Address) -> Self {
        Self {
            physical: address,
            prot: Prot::all(),
            page_size: PAGE_SIZE,
            global: true,
            asid: 0,
        }
    }
}

/// Stage-specific walk decisions, implemented by [`FirstStage`] and
/// [`GuestStage`] so that register-set selection, fault classification and
/// nested table-entry translation stay type-checked instead of
/// flag-checked.
pub(crate) trait StageOps {
    const NAME: &'static str;

    fn vm_mode(&self, hart: &HartState) -> VirtualMemoryMode;

    /// Privilege the leaf permission checks run at.
    fn privilege(&self) -> PrivilegeMode;

    fn sum(&self, hart: &HartState) -> bool;

    fn mxr(&self, hart: &HartState) -> bool;

    /// Translates the physical location of a table entry. Identity except
    /// for first-stage walks with an active G-stage, where the entry address
    /// is itself guest-physical.
    fn resolve_pte_addr(
        &self,
        machine: &RiscvMachine,
        pte_addr: Address,
        is_debug: bool,
    ) -> Result<Address, MmuFault>;
}

/// First-stage translation: `satp` (or the background `vsatp` when
/// servicing a hypervisor virtual-machine load/store from HS or M mode).
pub(crate) struct FirstStage {
    pub privilege: PrivilegeMode,
    /// Walk the background (VS) register set while `virt_enabled` is off.
    pub use_background: bool,
    /// The walked tables live in guest-physical space; every entry fetch
    /// goes through the G-stage first.
    pub two_stage: bool,
}

impl StageOps for FirstStage {
    const NAME: &'static str = "vs-stage";

    fn vm_mode(&self, hart: &HartState) -> VirtualMemoryMode {
        let raw = if self.use_background {
            hart.vsatp
        } else {
            hart.satp
        };
        VirtualMemoryMode::from_satp(raw, hart.xlen)
    }

    fn privilege(&self) -> PrivilegeMode {
        self.privilege
    }

    fn sum(&self, hart: &HartState) -> bool {
        if self.use_background {
            hart.vsstatus.sum()
        } else {
            hart.mstatus.sum()
        }
    }

    fn mxr(&self, hart: &HartState) -> bool {
        if self.use_background {
            hart.vsstatus.mxr()
        } else {
            hart.mstatus.mxr()
        }
    }

    fn resolve_pte_addr(
        &self,
        machine: &RiscvMachine,
        pte_addr: Address,
        is_debug: bool,
    ) -> Result<Address, MmuFault> {
        if !self.two_stage {
            return Ok(pte_addr);
        }
        machine
            .translate_guest_stage(pte_addr, AccessType::Load, is_debug)
            .map(|t| t.physical)
            .map_err(|_| MmuFault {
                kind: FaultKind::GuestPageFault,
                guest_phys_fault: Some(pte_addr.0 >> 2),
                two_stage_indirect: true,
            })
    }
}

/// G-stage translation: `hgatp`, guest-physical to supervisor-physical.
pub(crate) struct GuestStage;

impl StageOps for GuestStage {
    const NAME: &'static str = "g-stage";

    fn vm_mode(&self, hart: &HartState) -> VirtualMemoryMode {
        VirtualMemoryMode::from_hgatp(hart.hgatp, hart.xlen)
    }

    fn privilege(&self) -> PrivilegeMode {
        // Guest-physical accesses are user-level with respect to the
        // G-stage: every leaf must carry U.
        PrivilegeMode::User
    }

    fn sum(&self, _hart: &HartState) -> bool {
        false
    }

    fn mxr(&self, hart: &HartState) -> bool {
        hart.vsstatus.mxr()
    }

    fn resolve_pte_addr(
        &self,
        _machine: &RiscvMachine,
        pte_addr: Address,
        _is_debug: bool,
    ) -> Result<Address, MmuFault> {
        Ok(pte_addr)
    }
}

impl RiscvMachine {
    /// Translates one stage for `address`.
    ///
    /// `mode` is the effective privilege of the access (never `Machine`;
    /// machine-mode accesses bypass translation in the caller), `virt`
    /// selects the guest register set, `two_stage` marks an active G-stage
    /// underneath this one. `is_debug` walks read-only: no accessed/dirty
    /// updates, used by probes and the monitor.
    pub fn translate(
        &self,
        address: Address,
        access: AccessType,
        mode: PrivilegeMode,
        virt: bool,
        two_stage: bool,
        is_debug: bool,
    ) -> Result<Translation, MmuFault> {
        if mode == PrivilegeMode::Machine {
            return Ok(Translation::identity(address));
        }
        let stage = FirstStage {
            privilege: mode,
            use_background: virt && !self.hart.virt_enabled,
            two_stage,
        };
        self.walk(&stage, address, access, is_debug)
    }

    /// G-stage translation of a guest-physical address.
    pub fn translate_guest_stage(
        &self,
        address: Address,
        access: AccessType,
        is_debug: bool,
    ) -> Result<Translation, MmuFault> {
        self.walk(&GuestStage, address, access, is_debug)
    }

    fn walk<S: StageOps>(
        &self,
        stage: &S,
        address: Address,
        access: AccessType,
        is_debug: bool,
    ) -> Result<Translation, MmuFault> {
        let vm = stage.vm_mode(&self.hart);
        if vm.is_bare() {
            return Ok(Translation::identity(address));
        }
        if !vm.address_in_range(address.0, self.hart.xlen) {
            return Err(MmuFault::new(FaultKind::AccessFault));
        }

        let page_fault = || MmuFault::new(FaultKind::PageFault);
        let privilege = stage.privilege();
        let sum = stage.sum(&self.hart);
        let mxr = stage.mxr(&self.hart);
        let pte_width = match vm.pte_size {
            4 => Width::_32,
            8 => Width::_64,
            _ => unreachable!(),
        };
        log::trace!(
            "{}: walk {address} access {access:?} mode {privilege:?} {:?} root {}",
            S::NAME,
            vm.scheme,
            vm.root,
        );

        'restart: for _attempt in 0..AD_UPDATE_RETRIES {
            let mut base = vm.root;
            for i in 0..vm.levels {
                let ptshift = (vm.levels - 1 - i) * vm.index_bits;
                let index_bits = vm.index_bits + if i == 0 { vm.widened } else { 0 };
                let index =
                    (address.0 >> (PAGE_SHIFT + ptshift)) & ((1u64 << index_bits) - 1);

                let pte_addr = base + index * vm.pte_size;
                let pte_addr = stage.resolve_pte_addr(self, pte_addr, is_debug)?;

                let pmp = self.pmp_check(pte_addr, vm.pte_size, PrivilegeMode::Supervisor);
                if !pmp.prot.contains(Prot::READ) {
                    return Err(MmuFault::new(FaultKind::PmpFail));
                }

                let raw = self
                    .memory
                    .read(pte_addr, pte_width)
                    .map_err(|_| MmuFault::new(FaultKind::AccessFault))?;
                let pte = Pte::from(raw);
                log::trace!(
                    "{}: level {i} index {index} entry at {pte_addr} = {raw:#x}",
                    S::NAME,
                );

                if !pte.v() || (!pte.r() && pte.w()) {
                    return Err(page_fault());
                }
                if u8::from(pte.pbmt()) != 0 && !self.hart.has_ext(IsaExtensions::SVPBMT) {
                    return Err(page_fault());
                }
                if pte.n() && !self.hart.has_ext(IsaExtensions::SVNAPOT) {
                    return Err(page_fault());
                }
                if u8::from(pte.reserved_i()) != 0 {
                    return Err(page_fault());
                }

                if !pte.is_leaf() {
                    // Pointer to the next level; leaf-only attributes must
                    // be clear.
                    if pte.has_leaf_only_bits() {
                        return Err(page_fault());
                    }
                    base = Address(u64::from(pte.ppn()) << PAGE_SHIFT);
                    continue;
                }

                // Reserved combination: write without read.
                if pte.w() && !pte.r() {
                    return Err(page_fault());
                }

                if pte.u() {
                    match privilege {
                        PrivilegeMode::User => {}
                        PrivilegeMode::Supervisor => {
                            if !sum || access == AccessType::Fetch {
                                return Err(page_fault());
                            }
                        }
                        PrivilegeMode::Machine => unreachable!(),
                    }
                } else if privilege != PrivilegeMode::Supervisor {
                    return Err(page_fault());
                }

                match access {
                    AccessType::Load => {
                        if !(pte.r() || (mxr && pte.x())) {
                            return Err(page_fault());
                        }
                    }
                    AccessType::Store => {
                        if !pte.w() {
                            return Err(page_fault());
                        }
                    }
                    AccessType::Fetch => {
                        if !pte.x() {
                            return Err(page_fault());
                        }
                    }
                }

                let ppn = u64::from(pte.ppn());

                // Superpage leaves must be aligned on their natural
                // boundary.
                if ptshift > 0 && (ppn & ((1u64 << ptshift) - 1)) != 0 {
                    return Err(page_fault());
                }

                let napot_bits = if pte.n() {
                    // Svnapot defines exactly the 16-page contiguous range,
                    // final level only.
                    let napot_bits = ppn.trailing_zeros() + 1;
                    if ptshift != 0 || napot_bits != 4 {
                        return Err(page_fault());
                    }
                    napot_bits
                } else {
                    0
                };

                let needs_a = !pte.a();
                let needs_d = access == AccessType::Store && !pte.d();
                if (needs_a || needs_d) && !is_debug {
                    if !self.hart.has_ext(IsaExtensions::SVADU) {
                        return Err(page_fault());
                    }
                    let mut updated = pte;
                    updated.set_a(true);
                    if needs_d {
                        updated.set_d(true);
                    }
                    // The update must be atomic against the other harts
                    // sharing this table; losing the race restarts the walk
                    // from the root.
                    match self
                        .memory
                        .compare_exchange(pte_addr, raw, u64::from(updated), pte_width)
                    {
                        Ok(true) => {}
                        Ok(false) => continue 'restart,
                        Err(err) => {
                            log::trace!(
                                "{}: accessed/dirty update at {pte_addr} refused: {err}",
                                S::NAME,
                            );
                            return Err(page_fault());
                        }
                    }
                }

                let vpn = address.0 >> PAGE_SHIFT;
                let napot_mask = (1u64 << napot_bits) - 1;
                let physical = Address(
                    (((ppn & !napot_mask)
                        | (vpn & napot_mask)
                        | (vpn & ((1u64 << ptshift) - 1)))
                        << PAGE_SHIFT)
                        | address.offset_in(PAGE_SIZE),
                );
                let page_size = 1u64 << (PAGE_SHIFT + ptshift.max(napot_bits));
                log::trace!("{}: {address} -> {physical} ({page_size} bytes)", S::NAME);
                return Ok(Translation {
                    physical,
                    prot: pte.leaf_prot(mxr),
                    page_size,
                    global: pte.g(),
                    asid: vm.asid,
                });
            }
            // Walked all levels without finding a leaf.
            return Err(page_fault());
        }

        log::warn!(
            "{}: accessed/dirty update for {address} contended {AD_UPDATE_RETRIES} times",
            S::NAME,
        );
        Err(MmuFault::new(FaultKind::AccessFault))
    }
}

// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Physical memory protection.
//!
//! An ordered list of address-matching rules restricting physical accesses
//! independently of paging. The first rule (lowest index) covering the whole
//! access decides; locked rules bind M-mode too.

use crate::{
    cpu_state::PrivilegeMode,
    memory::{Address, Prot, PAGE_SIZE},
};

/// Number of PMP rules implemented by this hart.
pub const PMP_ENTRIES: usize = 16;

const PMP_R: u8 = 1 << 0;
const PMP_W: u8 = 1 << 1;
const PMP_X: u8 = 1 << 2;
const PMP_A_SHIFT: u8 = 3;
const PMP_A_MASK: u8 = 0x3;
const PMP_L: u8 = 1 << 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Address-matching mode of a rule, from the `A` field of its `pmpcfg` byte.
pub enum PmpAddressMatch {
    /// Rule is disabled.
    Off,
    /// Top of range: `[pmpaddr[i-1] << 2, pmpaddr[i] << 2)`.
    Tor,
    /// Naturally aligned 4-byte region.
    Na4,
    /// Naturally aligned power-of-two region, size from trailing ones.
    Napot,
}

impl PmpAddressMatch {
    pub fn from_bits(bits: u8) -> Self {
        match bits & PMP_A_MASK {
            0 => Self::Off,
            1 => Self::Tor,
            2 => Self::Na4,
            3 => Self::Napot,
            _ => unreachable!(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// One PMP rule: a `pmpcfg` byte and a `pmpaddr` word (physical address
/// shifted right by two).
pub struct PmpEntry {
    pub cfg: u8,
    pub addr: u64,
}

impl PmpEntry {
    pub fn address_match(&self) -> PmpAddressMatch {
        PmpAddressMatch::from_bits(self.cfg >> PMP_A_SHIFT)
    }

    pub fn is_locked(&self) -> bool {
        self.cfg & PMP_L != 0
    }

    /// Permissions this rule grants when it matches.
    pub fn prot(&self) -> Prot {
        let mut prot = Prot::empty();
        if self.cfg & PMP_R != 0 {
            prot |= Prot::READ;
        }
        if self.cfg & PMP_W != 0 {
            prot |= Prot::WRITE;
        }
        if self.cfg & PMP_X != 0 {
            prot |= Prot::EXEC;
        }
        prot
    }

    /// Inclusive byte-address range `[sa, ea]` of this rule, or `None` for
    /// disabled/empty rules. `previous_addr` is the `pmpaddr` word of the
    /// preceding rule, used by TOR.
    fn range(&self, previous_addr: u64) -> Option<(u64, u64)> {
        match self.address_match() {
            PmpAddressMatch::Off => None,
            PmpAddressMatch::Tor => {
                let sa = previous_addr << 2;
                let ea = (self.addr << 2).checked_sub(1)?;
                if ea < sa {
                    return None;
                }
                Some((sa, ea))
            }
            PmpAddressMatch::Na4 => {
                let sa = self.addr << 2;
                Some((sa, sa + 3))
            }
            PmpAddressMatch::Napot => {
                let trailing = (!self.addr).trailing_zeros();
                if trailing + 3 >= 64 {
                    return Some((0, u64::MAX));
                }
                let size = 1u64 << (trailing + 3);
                let sa = (self.addr << 2) & !(size - 1);
                Some((sa, sa + (size - 1)))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Outcome of a PMP authority check.
pub struct PmpCheck {
    /// Permissions granted for the queried access range.
    pub prot: Prot,
    /// Index of the rule that decided, if any rule matched.
    pub matched: Option<usize>,
    /// Largest power-of-two page size, aligned at the queried address, that
    /// stays inside the matched rule. Translations cached beyond this
    /// granularity would over-extend the rule's permissions, so the fill
    /// coordinator caps installed page sizes with it. `u64::MAX` when
    /// unconstrained.
    pub page_size_cap: u64,
}

impl PmpCheck {
    pub(crate) fn unrestricted() -> Self {
        Self {
            prot: Prot::all(),
            matched: None,
            page_size_cap: u64::MAX,
        }
    }

    fn denied(index: usize) -> Self {
        Self {
            prot: Prot::empty(),
            matched: Some(index),
            page_size_cap: 1,
        }
    }
}

#[derive(Debug, Default)]
/// The PMP rule file of one hart.
pub struct Pmp {
    entries: [PmpEntry; PMP_ENTRIES],
}

impl Pmp {
    pub fn entries(&self) -> &[PmpEntry] {
        &self.entries
    }

    /// Writes a `pmpcfg` byte. Locked rules are write-ignored.
    pub fn set_cfg(&mut self, index: usize, cfg: u8) {
        if index < PMP_ENTRIES && !self.entries[index].is_locked() {
            self.entries[index].cfg = cfg;
        }
    }

    /// Writes a `pmpaddr` word. Locked rules are write-ignored, as is the
    /// base of a locked TOR rule above.
    pub fn set_addr(&mut self, index: usize, addr: u64) {
        if index >= PMP_ENTRIES || self.entries[index].is_locked() {
            return;
        }
        if let Some(next) = self.entries.get(index + 1) {
            if next.is_locked() && next.address_match() == PmpAddressMatch::Tor {
                return;
            }
        }
        self.entries[index].addr = addr;
    }

    pub fn get_cfg(&self, index: usize) -> u8 {
        self.entries.get(index).map_or(0, |e| e.cfg)
    }

    pub fn get_addr(&self, index: usize) -> u64 {
        self.entries.get(index).map_or(0, |e| e.addr)
    }

    /// Returns whether any rule is active.
    pub fn any_rules(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.address_match() != PmpAddressMatch::Off)
    }

    /// Evaluates the rule list for `[addr, addr + size)` at privilege
    /// `mode`.
    ///
    /// The first rule covering the whole range decides. A rule covering only
    /// part of the range denies the access outright. With rules configured
    /// but none matching, M-mode is unrestricted and lower modes get
    /// nothing; with no rules at all, every mode is unrestricted.
    pub fn check(&self, addr: Address, size: u64, mode: PrivilegeMode) -> PmpCheck {
        debug_assert!(size > 0);
        if !self.any_rules() {
            // Nothing configured yet (e.g. before firmware ran): no
            // restrictions in any mode.
            return PmpCheck::unrestricted();
        }
        let start = addr.0;
        let end = start + (size - 1);

        let mut previous_addr = 0;
        for (index, entry) in self.entries.iter().enumerate() {
            let Some((sa, ea)) = entry.range(previous_addr) else {
                previous_addr = entry.addr;
                continue;
            };
            previous_addr = entry.addr;

            let covers_start = (sa..=ea).contains(&start);
            let covers_end = (sa..=ea).contains(&end);
            if !covers_start && !covers_end {
                continue;
            }
            if covers_start != covers_end {
                // Straddling a rule boundary fails regardless of mode.
                return PmpCheck::denied(index);
            }

            let prot = if mode == PrivilegeMode::Machine && !entry.is_locked() {
                Prot::all()
            } else {
                entry.prot()
            };
            return PmpCheck {
                prot,
                matched: Some(index),
                page_size_cap: Self::page_size_cap(start, sa, ea),
            };
        }

        if mode == PrivilegeMode::Machine {
            PmpCheck::unrestricted()
        } else {
            PmpCheck {
                prot: Prot::empty(),
                matched: None,
                page_size_cap: 1,
            }
        }
    }

    /// Largest naturally aligned power-of-two block around `addr` that fits
    /// inside `[sa, ea]`, starting the search at the base page size.
    fn page_size_cap(addr: u64, sa: u64, ea: u64) -> u64 {
        let fits = |size: u64| {
            let page = addr & !(size - 1);
            page >= sa && page.checked_add(size - 1).is_some_and(|last| last <= ea)
        };
        if !fits(PAGE_SIZE) {
            return 1;
        }
        let mut size = PAGE_SIZE;
        while let Some(next) = size.checked_mul(2) {
            if !fits(next) {
                break;
            }
            size = next;
        }
        size
    }
}

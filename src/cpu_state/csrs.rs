// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Bitfield views of the control and status registers this core consumes.
//!
//! Every register the walker, aggregator or dispatcher reads is modelled as
//! a [`bilge`] bitfield so shift/mask constants live in exactly one place.
//! Fields are declared LSB first.

use bilge::prelude::*;

use crate::cpu_state::PrivilegeMode;

#[bitsize(64)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// `mstatus` (RV64 layout). The supervisor-visible `sstatus` is a masked
/// view of this register; `vsstatus` uses the same layout.
pub struct Mstatus {
    pub _res0: u1,
    /// Supervisor interrupt enable. (bit `[1]`)
    pub sie: bool,
    pub _res1: u1,
    /// Machine interrupt enable. (bit `[3]`)
    pub mie: bool,
    pub _res2: u1,
    /// Previous supervisor interrupt enable. (bit `[5]`)
    pub spie: bool,
    /// U-mode big endianness. (bit `[6]`)
    pub ube: bool,
    /// Previous machine interrupt enable. (bit `[7]`)
    pub mpie: bool,
    /// Previous supervisor privilege. (bit `[8]`)
    pub spp: u1,
    /// Vector unit state. (bits `[10:9]`)
    pub vs: u2,
    /// Previous machine privilege. (bits `[12:11]`)
    pub mpp: u2,
    /// Floating point unit state. (bits `[14:13]`)
    pub fs: u2,
    /// Additional extension state. (bits `[16:15]`)
    pub xs: u2,
    /// Modify privilege: loads/stores execute at [`Self::mpp`]. (bit `[17]`)
    pub mprv: bool,
    /// Permit supervisor user memory access. (bit `[18]`)
    pub sum: bool,
    /// Make executable readable. (bit `[19]`)
    pub mxr: bool,
    /// Trap virtual memory management operations. (bit `[20]`)
    pub tvm: bool,
    /// Timeout wait. (bit `[21]`)
    pub tw: bool,
    /// Trap SRET. (bit `[22]`)
    pub tsr: bool,
    pub _res3: u9,
    /// U-mode XLEN. (bits `[33:32]`)
    pub uxl: u2,
    /// S-mode XLEN. (bits `[35:34]`)
    pub sxl: u2,
    /// S-mode big endianness. (bit `[36]`)
    pub sbe: bool,
    /// M-mode big endianness. (bit `[37]`)
    pub mbe: bool,
    /// Guest virtual address: `mtval`/`stval` hold one. (bit `[38]`)
    pub gva: bool,
    /// Machine previous virtualization mode. (bit `[39]`)
    pub mpv: bool,
    pub _res4: u23,
    /// State dirty summary. (bit `[63]`)
    pub sd: bool,
}

impl Mstatus {
    /// The `sstatus` field subset exchanged between the host and guest
    /// register views on virtualization transitions.
    pub const SWAP_MASK: u64 = (1 << 1)    // SIE
        | (1 << 5)                         // SPIE
        | (1 << 8)                         // SPP
        | (0b11 << 13)                     // FS
        | (1 << 18)                        // SUM
        | (1 << 19)                        // MXR
        | (0b11 << 32); // UXL

    /// Decoded previous machine privilege.
    pub fn mpp_mode(&self) -> PrivilegeMode {
        PrivilegeMode::from_code(u64::from(self.mpp()))
    }

    /// Decoded previous supervisor privilege.
    pub fn spp_mode(&self) -> PrivilegeMode {
        PrivilegeMode::from_code(u64::from(self.spp()))
    }
}

#[bitsize(64)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// `hstatus` (RV64 layout).
pub struct Hstatus {
    pub _res0: u5,
    /// VS-mode big endianness. (bit `[5]`)
    pub vsbe: bool,
    /// Guest virtual address: `htval` companion. (bit `[6]`)
    pub gva: bool,
    /// Supervisor previous virtualization mode. (bit `[7]`)
    pub spv: bool,
    /// Supervisor previous virtual privilege. (bit `[8]`)
    pub spvp: u1,
    /// Hypervisor user-mode accesses permitted. (bit `[9]`)
    pub hu: bool,
    pub _res1: u2,
    /// Virtual guest external interrupt number. (bits `[17:12]`)
    pub vgein: u6,
    pub _res2: u2,
    /// Trap virtual memory management operations from VS. (bit `[20]`)
    pub vtvm: bool,
    /// Timeout wait for VS. (bit `[21]`)
    pub vtw: bool,
    /// Trap SRET from VS. (bit `[22]`)
    pub vtsr: bool,
    pub _res3: u9,
    /// VS-mode XLEN. (bits `[33:32]`)
    pub vsxl: u2,
    pub _res4: u30,
}

#[bitsize(64)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// `satp`/`vsatp` (RV64 layout): mode field is 4 bits wide at `[63:60]`.
pub struct Satp {
    /// Root page table physical page number. (bits `[43:0]`)
    pub ppn: u44,
    /// Address space identifier. (bits `[59:44]`)
    pub asid: u16,
    /// Translation scheme selector. (bits `[63:60]`)
    pub mode: u4,
}

#[bitsize(32)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// `satp`/`vsatp` (RV32 layout): mode field is a single bit at `[31]`.
pub struct Satp32 {
    /// Root page table physical page number. (bits `[21:0]`)
    pub ppn: u22,
    /// Address space identifier. (bits `[30:22]`)
    pub asid: u9,
    /// Translation scheme selector: `Bare` or `Sv32`. (bit `[31]`)
    pub mode: u1,
}

#[bitsize(64)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// `hgatp` (RV64 layout).
pub struct Hgatp {
    /// Root page table physical page number. (bits `[43:0]`)
    pub ppn: u44,
    /// Virtual machine identifier. (bits `[57:44]`)
    pub vmid: u14,
    pub _res: u2,
    /// Translation scheme selector. (bits `[63:60]`)
    pub mode: u4,
}

#[bitsize(32)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// `hgatp` (RV32 layout).
pub struct Hgatp32 {
    /// Root page table physical page number. (bits `[21:0]`)
    pub ppn: u22,
    /// Virtual machine identifier. (bits `[28:22]`)
    pub vmid: u7,
    pub _res: u2,
    /// Translation scheme selector: `Bare` or `Sv32x4`. (bit `[31]`)
    pub mode: u1,
}

#[bitsize(64)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
/// `mtvec`/`stvec`/`vstvec`.
pub struct TrapVector {
    /// Vectoring mode: `0` direct, `1` vectored. (bits `[1:0]`)
    pub mode: u2,
    /// Handler base address, 4-byte units. (bits `[63:2]`)
    pub base: u62,
}

impl TrapVector {
    /// Entry point for a trap with the given cause number.
    ///
    /// The vectored offset applies to asynchronous causes only.
    pub fn handler_address(&self, cause: u64, is_interrupt: bool) -> u64 {
        let base = u64::from(self.base()) << 2;
        if is_interrupt && u8::from(self.mode()) == 1 {
            base + cause * 4
        } else {
            base
        }
    }
}

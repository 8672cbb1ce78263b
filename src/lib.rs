// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! # sechellia
//!
//! The privileged-architecture core of a RISC-V instruction-set emulator:
//! two-stage address translation (`Sv32`/`Sv39`/`Sv48`/`Sv57` plus the
//! hypervisor G-stage), physical memory protection, interrupt aggregation
//! with the advanced-interrupt-architecture priority scheme, and trap
//! delivery into M, HS or VS mode.
//!
//! The crate deliberately ends at the privileged architecture: instruction
//! decode/execution, device models and host acceleration are external
//! collaborators. They consume [`machine::RiscvMachine::fill`] for memory
//! accesses, [`cpu_state::HartState::pending_interrupt`] before each
//! instruction, and [`machine::RiscvMachine::take_trap`] to deliver what
//! either reports.

pub mod cpu_state;
pub mod exceptions;
pub mod interrupts;
pub mod machine;
pub mod memory;

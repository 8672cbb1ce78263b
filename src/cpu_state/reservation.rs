// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

use crate::memory::Address;

/// Load-reservation state backing the LR/SC sequence.
///
/// A reservation must not outlive the privilege/virtualization context that
/// set it, so the trap dispatcher clears this unconditionally.
#[derive(Default, Debug)]
pub struct LoadReservation {
    marked_address: Option<Address>,
}

impl LoadReservation {
    /// Reservations cover the naturally aligned 8-byte granule.
    const GRANULE: u64 = 8;

    fn granule(address: Address) -> Address {
        address.align_down(Self::GRANULE)
    }

    /// Places a reservation, replacing any previous one.
    pub fn set(&mut self, address: Address) {
        self.marked_address = Some(Self::granule(address));
    }

    /// Consumes the reservation; returns whether it still covered `address`.
    pub fn check(&mut self, address: Address) -> bool {
        let reservation = Self::granule(address);
        self.marked_address.take() == Some(reservation)
    }

    pub fn clear(&mut self) {
        self.marked_address.take();
    }
}

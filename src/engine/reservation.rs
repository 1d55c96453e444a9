//! Optimistic quantity holds against each target's remaining capacity.
//!
//! The ledger is plain data; the engine keeps it under its state mutex so
//! that a reserve and the `purchased_qty` it was checked against cannot
//! drift apart. Invariant: `purchased + reserved <= target_qty` whenever
//! `target_qty > 0`.

use std::collections::HashMap;

use crate::model::TargetId;

#[derive(Debug, Default)]
pub struct ReservationLedger {
    reserved: HashMap<TargetId, u32>,
}

impl ReservationLedger {
    pub fn reserved(&self, target_id: &str) -> u32 {
        self.reserved.get(target_id).copied().unwrap_or(0)
    }

    /// Units still available to reserve. `None` means unbounded.
    pub fn remaining(&self, target_id: &str, target_qty: u32, purchased: u32) -> Option<u32> {
        if target_qty == 0 {
            return None;
        }
        Some(
            target_qty
                .saturating_sub(purchased)
                .saturating_sub(self.reserved(target_id)),
        )
    }

    /// Hold `qty` units if they fit. Returns false (and holds nothing) otherwise.
    pub fn try_reserve(&mut self, target_id: &str, qty: u32, target_qty: u32, purchased: u32) -> bool {
        if matches!(self.remaining(target_id, target_qty, purchased), Some(left) if left < qty) {
            return false;
        }
        *self.reserved.entry(target_id.to_string()).or_insert(0) += qty;
        true
    }

    /// Drop a hold without buying.
    pub fn release(&mut self, target_id: &str, qty: u32) {
        if let Some(held) = self.reserved.get_mut(target_id) {
            *held = held.saturating_sub(qty);
            if *held == 0 {
                self.reserved.remove(target_id);
            }
        }
    }

    /// Turn a hold into a purchase.
    pub fn commit(&mut self, target_id: &str, qty: u32, purchased: &mut u32) {
        self.release(target_id, qty);
        *purchased += qty;
    }

    pub fn clear(&mut self) {
        self.reserved.clear();
    }
}

use log::info;

use crate::keeper::{ReservationId, UtxoKeeper};

/// Reservations taken by one build attempt.
///
/// Either [`commit`](Rollback::commit) hands them to the caller, or
/// [`rollback`](Rollback::rollback) releases all of them. Dropping an uncommitted
/// `Rollback` releases them too, so an early return or a panic never leaves outputs locked.
pub struct Rollback<'a> {
    keeper: &'a UtxoKeeper,
    reservations: Vec<ReservationId>,
}

impl<'a> Rollback<'a> {
    pub fn new(keeper: &'a UtxoKeeper) -> Self {
        Self {
            keeper,
            reservations: Vec::new(),
        }
    }

    pub fn track(&mut self, reservation_id: ReservationId) {
        self.reservations.push(reservation_id);
    }

    pub fn extend(&mut self, reservation_ids: impl IntoIterator<Item = ReservationId>) {
        self.reservations.extend(reservation_ids);
    }

    /// Keeps the reservations and returns their handles.
    pub fn commit(mut self) -> Vec<ReservationId> {
        std::mem::take(&mut self.reservations)
    }

    /// Cancels every tracked reservation. Already released handles are ignored by the keeper.
    pub fn rollback(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.reservations.is_empty() {
            return;
        }
        info!(
            target: "audit",
            reservations = self.reservations.len();
            "Rollback: Releasing reservations of failed build"
        );
        for reservation_id in self.reservations.drain(..) {
            self.keeper.cancel(&reservation_id);
        }
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

//! Greedy coin selection.
//!
//! Candidates are taken largest first, so a target is reached with as few inputs as
//! possible. Equal amounts are ordered by output id, which makes the selection a pure
//! function of the pool contents.

use std::cmp::Reverse;

use crate::models::Utxo;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    /// Saturates at `u64::MAX`; see `overflowed`
    pub total: u64,
    /// The selected amounts do not fit in a `u64`
    pub overflowed: bool,
}

impl Selection {
    pub fn covers(&self, amount: u64) -> bool {
        self.total >= amount
    }
}

/// Sorts `utxos` descending by amount, ties broken by ascending output id.
pub fn sort_for_selection(utxos: &mut [Utxo]) {
    utxos.sort_by_key(|u| (Reverse(u.amount), u.output_id));
}

/// Accumulates candidates in selection order until `amount` is reached or the
/// candidates run out. The returned total may exceed `amount`.
pub fn select_coins<'a, I>(candidates: I, amount: u64) -> Selection
where
    I: IntoIterator<Item = &'a Utxo>,
{
    let mut ordered: Vec<Utxo> = candidates.into_iter().cloned().collect();
    sort_for_selection(&mut ordered);

    let mut selection = Selection::default();
    for utxo in ordered {
        if selection.covers(amount) {
            break;
        }
        match selection.total.checked_add(utxo.amount) {
            Some(total) => selection.total = total,
            None => {
                selection.total = u64::MAX;
                selection.overflowed = true;
            },
        }
        selection.utxos.push(utxo);
    }
    selection
}

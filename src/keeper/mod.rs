//! UTXO reservation for transaction construction.
//!
//! The [`UtxoKeeper`] owns the in-memory view of an account manager's spendable outputs and
//! decides which of them are free to be selected. Selected outputs are locked under a
//! [`Reservation`] until the caller cancels it or its expiry passes, so two concurrent
//! build attempts never pick the same output.
//!
//! # Overview
//!
//! 1. The pool is hydrated from a [`UtxoStore`] once, outside the keeper's lock
//! 2. [`UtxoKeeper::reserve`] selects free outputs largest first and locks them
//! 3. The caller either consumes the outputs or releases them with [`UtxoKeeper::cancel`]
//! 4. Abandoned reservations are released by [`UtxoKeeper::sweep_expired`], which also runs
//!    at the start of every reservation
//!
//! All state lives behind one mutex. The critical section only touches in-memory indices
//! and never performs I/O.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::UtxoStore,
    log::mask_amount,
    models::{AssetId, OutputId, Utxo, UtxoKey},
};

mod error;
pub use error::KeeperError;

mod reservation;
pub use reservation::{Balance, KeeperSnapshot, Reservation, ReservationId, ReservedUtxos};

pub mod selection;
use selection::select_coins;

#[derive(Default)]
struct KeeperState {
    pool: HashMap<UtxoKey, BTreeMap<OutputId, Utxo>>,
    keys: HashMap<OutputId, UtxoKey>,
    reserved: HashMap<OutputId, ReservationId>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl KeeperState {
    fn insert(&mut self, utxo: Utxo) -> bool {
        let key = utxo.key();
        if let Some(previous) = self.keys.insert(utxo.output_id, key.clone())
            && previous != key
            && let Some(outputs) = self.pool.get_mut(&previous)
        {
            outputs.remove(&utxo.output_id);
        }
        self.pool
            .entry(key)
            .or_default()
            .insert(utxo.output_id, utxo)
            .is_none()
    }

    fn remove(&mut self, output_id: &OutputId) -> Option<Utxo> {
        let key = self.keys.remove(output_id)?;
        let utxo = self.pool.get_mut(&key).and_then(|outputs| outputs.remove(output_id));
        if self.pool.get(&key).is_some_and(BTreeMap::is_empty) {
            self.pool.remove(&key);
        }

        if let Some(reservation_id) = self.reserved.remove(output_id)
            && let Some(reservation) = self.reservations.get_mut(&reservation_id)
        {
            reservation.utxos.retain(|id| id != output_id);
            if reservation.utxos.is_empty() {
                self.reservations.remove(&reservation_id);
            }
        }
        utxo
    }

    fn release(&mut self, reservation_id: &ReservationId) -> Option<Reservation> {
        let reservation = self.reservations.remove(reservation_id)?;
        for output_id in &reservation.utxos {
            self.reserved.remove(output_id);
        }
        Some(reservation)
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Reservation> {
        let expired: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();
        expired.iter().filter_map(|id| self.release(id)).collect()
    }

    fn lock_outputs(
        &mut self,
        key: UtxoKey,
        utxos: &[Utxo],
        total: u64,
        requested: u64,
        expiry: DateTime<Utc>,
    ) -> Reservation {
        let id = Uuid::new_v4();
        for utxo in utxos {
            self.reserved.insert(utxo.output_id, id);
        }
        let reservation = Reservation {
            id,
            key,
            utxos: utxos.iter().map(|u| u.output_id).collect(),
            total,
            change: total.saturating_sub(requested),
            expiry,
        };
        self.reservations.insert(id, reservation.clone());
        reservation
    }

    fn balance(&self, key: &UtxoKey, exclude: &[OutputId]) -> Balance {
        let mut balance = Balance::default();
        for utxo in self.pool.get(key).into_iter().flat_map(BTreeMap::values) {
            if exclude.contains(&utxo.output_id) {
                continue;
            }
            if self.reserved.contains_key(&utxo.output_id) {
                balance.reserved = balance.reserved.saturating_add(utxo.amount);
            } else {
                balance.free = balance.free.saturating_add(utxo.amount);
            }
        }
        balance
    }
}

/// Concurrency-safe owner of UTXO reservation state.
///
/// Share it between build attempts with an `Arc`; every method takes `&self`.
#[derive(Default)]
pub struct UtxoKeeper {
    state: Mutex<KeeperState>,
}

impl UtxoKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, KeeperState> {
        // State is only mutated through complete index updates, so a poisoned guard is consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the records of `store` (optionally one account only) into the free pool.
    ///
    /// The store is read before the lock is taken. Returns the number of outputs that were
    /// not already known.
    pub fn hydrate(&self, store: &dyn UtxoStore, account_id: Option<&str>) -> Result<usize, KeeperError> {
        let utxos = store.iterate(account_id)?;

        let mut state = self.state();
        let mut added = 0;
        for utxo in utxos {
            if utxo.amount == 0 {
                warn!(output_id:% = utxo.output_id; "Keeper: Skipping zero-amount UTXO");
                continue;
            }
            if state.insert(utxo) {
                added += 1;
            }
        }

        info!(added = added, account_id = account_id.unwrap_or("*"); "Keeper: Pool hydrated");
        Ok(added)
    }

    /// Registers a newly confirmed output. Returns `false` if it was already known or
    /// carries no value.
    pub fn add_utxo(&self, utxo: Utxo) -> bool {
        if utxo.amount == 0 {
            warn!(output_id:% = utxo.output_id; "Keeper: Skipping zero-amount UTXO");
            return false;
        }
        debug!(output_id:% = utxo.output_id, account_id = utxo.account_id.as_str(); "Keeper: Adding UTXO");
        self.state().insert(utxo)
    }

    /// Forgets an output that was consumed on chain, dropping it from any reservation.
    pub fn remove_utxo(&self, output_id: &OutputId) -> Option<Utxo> {
        debug!(output_id:% = output_id; "Keeper: Removing UTXO");
        self.state().remove(output_id)
    }

    /// Selects and locks free outputs of `asset_id` owned by `account_id` covering `amount`.
    ///
    /// Outputs are taken in descending amount order (ties by output id) until the amount is
    /// reached. Outputs listed in `exclude` are ignored entirely. The returned total may exceed
    /// `amount`; the difference is reported as `change`.
    ///
    /// # Errors
    ///
    /// - [`KeeperError::Insufficient`] if free plus reserved funds are below `amount`
    /// - [`KeeperError::Reserved`] if enough funds exist but too many are locked
    /// - [`KeeperError::InvalidAmount`] if `amount` is zero
    pub fn reserve(
        &self,
        account_id: &str,
        asset_id: &AssetId,
        amount: u64,
        exclude: &[OutputId],
        expiry: DateTime<Utc>,
    ) -> Result<ReservedUtxos, KeeperError> {
        if amount == 0 {
            return Err(KeeperError::InvalidAmount("cannot reserve a zero amount".to_string()));
        }
        let key = UtxoKey::new(account_id, *asset_id);

        let mut state = self.state();
        log_swept(&state.sweep(Utc::now()));

        let selection = {
            let reserved = &state.reserved;
            let candidates = state
                .pool
                .get(&key)
                .into_iter()
                .flat_map(BTreeMap::values)
                .filter(|u| !reserved.contains_key(&u.output_id) && !exclude.contains(&u.output_id));
            select_coins(candidates, amount)
        };

        if !selection.covers(amount) {
            let balance = state.balance(&key, exclude);
            if balance.total() < amount {
                return Err(KeeperError::Insufficient {
                    key,
                    available: balance.total(),
                    required: amount,
                });
            }
            return Err(KeeperError::Reserved {
                key,
                free: balance.free,
                reserved: balance.reserved,
                required: amount,
            });
        }

        if selection.overflowed {
            return Err(KeeperError::InvalidAmount(format!(
                "UTXOs selected for {key} sum to more than {}",
                u64::MAX
            )));
        }

        let reservation = state.lock_outputs(key, &selection.utxos, selection.total, amount, expiry);
        drop(state);

        info!(
            target: "audit",
            reservation_id:% = reservation.id,
            key:% = reservation.key,
            utxos = reservation.utxos.len(),
            total = &*mask_amount(reservation.total);
            "Keeper: Reserved UTXOs"
        );

        Ok(ReservedUtxos {
            id: reservation.id,
            utxos: selection.utxos,
            total: reservation.total,
            change: reservation.change,
            expiry,
        })
    }

    /// Locks one named output, bypassing selection.
    ///
    /// # Errors
    ///
    /// - [`KeeperError::NotFound`] if the keeper does not know the output
    /// - [`KeeperError::Reserved`] if it is already locked
    pub fn reserve_particular(&self, output_id: &OutputId, expiry: DateTime<Utc>) -> Result<ReservedUtxos, KeeperError> {
        let mut state = self.state();
        log_swept(&state.sweep(Utc::now()));

        let key = state
            .keys
            .get(output_id)
            .cloned()
            .ok_or(KeeperError::NotFound(*output_id))?;
        let utxo = state
            .pool
            .get(&key)
            .and_then(|outputs| outputs.get(output_id))
            .cloned()
            .ok_or(KeeperError::NotFound(*output_id))?;

        if state.reserved.contains_key(output_id) {
            return Err(KeeperError::Reserved {
                key,
                free: 0,
                reserved: utxo.amount,
                required: utxo.amount,
            });
        }

        let reservation = state.lock_outputs(key, std::slice::from_ref(&utxo), utxo.amount, utxo.amount, expiry);
        drop(state);

        info!(
            target: "audit",
            reservation_id:% = reservation.id,
            output_id:% = output_id;
            "Keeper: Reserved particular UTXO"
        );

        Ok(ReservedUtxos {
            id: reservation.id,
            total: utxo.amount,
            utxos: vec![utxo],
            change: 0,
            expiry,
        })
    }

    /// Releases every output locked under `reservation_id`. Unknown or already released
    /// handles are ignored.
    pub fn cancel(&self, reservation_id: &ReservationId) {
        let released = self.state().release(reservation_id);
        if let Some(reservation) = released {
            info!(
                target: "audit",
                reservation_id:% = reservation.id,
                utxos = reservation.utxos.len();
                "Keeper: Reservation cancelled"
            );
        }
    }

    /// Releases all reservations whose expiry is before `now`. Returns how many were released.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let swept = self.state().sweep(now);
        log_swept(&swept);
        swept.len()
    }

    pub fn balance(&self, account_id: &str, asset_id: &AssetId) -> Balance {
        self.state().balance(&UtxoKey::new(account_id, *asset_id), &[])
    }

    pub fn reservation(&self, reservation_id: &ReservationId) -> Option<Reservation> {
        self.state().reservations.get(reservation_id).cloned()
    }

    pub fn reserved_count(&self) -> usize {
        self.state().reserved.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.state().reservations.len()
    }

    pub fn utxo_count(&self) -> usize {
        self.state().keys.len()
    }

    pub fn snapshot(&self) -> KeeperSnapshot {
        let state = self.state();
        KeeperSnapshot {
            pool: state.keys.keys().copied().collect(),
            reserved: state.reserved.iter().map(|(k, v)| (*k, *v)).collect(),
            reservations: state.reservations.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }
}

fn log_swept(swept: &[Reservation]) {
    for reservation in swept {
        info!(
            target: "audit",
            reservation_id:% = reservation.id,
            key:% = reservation.key,
            expiry:% = reservation.expiry;
            "Keeper: Reservation expired"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::{
        db::MemoryUtxoStore,
        models::{Hash, NATIVE_ASSET_ID},
    };

    fn utxo(id: u64, account: &str, asset: AssetId, amount: u64) -> Utxo {
        Utxo {
            output_id: Hash::from_u64(id),
            source_id: Hash::from_u64(2),
            source_pos: 0,
            asset_id: asset,
            amount,
            account_id: account.to_string(),
            control_program: vec![0x51],
            address: format!("addr-{id}"),
            control_program_index: id,
            change: false,
        }
    }

    fn keeper_with(amounts: &[u64]) -> UtxoKeeper {
        let keeper = UtxoKeeper::new();
        for (i, amount) in amounts.iter().enumerate() {
            keeper.add_utxo(utxo(i as u64, "acc", NATIVE_ASSET_ID, *amount));
        }
        keeper
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + Duration::minutes(5)
    }

    #[test]
    fn test_reserve_selects_largest_first() {
        let keeper = keeper_with(&[10, 50, 30, 20]);

        let res = keeper.reserve("acc", &NATIVE_ASSET_ID, 60, &[], later()).unwrap();
        let amounts: Vec<u64> = res.utxos.iter().map(|u| u.amount).collect();
        assert_eq!(amounts, vec![50, 30]);
        assert_eq!(res.total, 80);
        assert_eq!(res.change, 20);
        assert_eq!(keeper.reserved_count(), 2);
        assert_eq!(keeper.balance("acc", &NATIVE_ASSET_ID), Balance { free: 30, reserved: 80 });
    }

    #[test]
    fn test_reserved_outputs_are_skipped() {
        let keeper = keeper_with(&[10, 50, 30, 20]);

        let first = keeper.reserve("acc", &NATIVE_ASSET_ID, 40, &[], later()).unwrap();
        let second = keeper.reserve("acc", &NATIVE_ASSET_ID, 40, &[], later()).unwrap();

        let first_ids: Vec<_> = first.utxos.iter().map(|u| u.output_id).collect();
        assert!(second.utxos.iter().all(|u| !first_ids.contains(&u.output_id)));
        assert_eq!(second.total, 50);
    }

    #[test]
    fn test_insufficient_vs_reserved() {
        let keeper = keeper_with(&[10, 20]);

        let err = keeper.reserve("acc", &NATIVE_ASSET_ID, 31, &[], later()).unwrap_err();
        assert!(matches!(err, KeeperError::Insufficient { available: 30, required: 31, .. }));

        keeper.reserve("acc", &NATIVE_ASSET_ID, 15, &[], later()).unwrap();
        let err = keeper.reserve("acc", &NATIVE_ASSET_ID, 15, &[], later()).unwrap_err();
        assert!(matches!(err, KeeperError::Reserved { free: 10, reserved: 20, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_keys_do_not_mix() {
        let other_asset = Hash::from_u64(42);
        let keeper = UtxoKeeper::new();
        keeper.add_utxo(utxo(1, "acc", NATIVE_ASSET_ID, 100));
        keeper.add_utxo(utxo(2, "other", NATIVE_ASSET_ID, 100));
        keeper.add_utxo(utxo(3, "acc", other_asset, 100));

        let err = keeper.reserve("acc", &NATIVE_ASSET_ID, 150, &[], later()).unwrap_err();
        assert!(matches!(err, KeeperError::Insufficient { available: 100, .. }));
        let res = keeper.reserve("acc", &other_asset, 100, &[], later()).unwrap();
        assert_eq!(res.utxos[0].output_id, Hash::from_u64(3));
    }

    #[test]
    fn test_exclude_list_is_respected() {
        let keeper = keeper_with(&[50, 40]);

        let res = keeper
            .reserve("acc", &NATIVE_ASSET_ID, 30, &[Hash::from_u64(0)], later())
            .unwrap();
        assert_eq!(res.utxos[0].output_id, Hash::from_u64(1));

        let err = keeper
            .reserve("acc", &NATIVE_ASSET_ID, 60, &[Hash::from_u64(0)], later())
            .unwrap_err();
        assert!(matches!(err, KeeperError::Insufficient { available: 40, .. }));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let keeper = keeper_with(&[10]);
        let err = keeper.reserve("acc", &NATIVE_ASSET_ID, 0, &[], later()).unwrap_err();
        assert!(matches!(err, KeeperError::InvalidAmount(_)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let keeper = keeper_with(&[10, 20]);
        let before = keeper.snapshot();

        let res = keeper.reserve("acc", &NATIVE_ASSET_ID, 25, &[], later()).unwrap();
        assert_eq!(keeper.reservation_count(), 1);

        keeper.cancel(&res.id);
        keeper.cancel(&res.id);
        keeper.cancel(&Uuid::new_v4());
        assert_eq!(keeper.snapshot(), before);
    }

    #[test]
    fn test_expired_reservations_are_swept_on_reserve() {
        let keeper = keeper_with(&[10]);

        let stale = keeper
            .reserve("acc", &NATIVE_ASSET_ID, 10, &[], Utc::now() - Duration::seconds(1))
            .unwrap();
        assert_eq!(keeper.reserved_count(), 1);

        let fresh = keeper.reserve("acc", &NATIVE_ASSET_ID, 10, &[], later()).unwrap();
        assert_ne!(stale.id, fresh.id);
        assert!(keeper.reservation(&stale.id).is_none());
        assert_eq!(keeper.reservation_count(), 1);
    }

    #[test]
    fn test_sweep_expired() {
        let keeper = keeper_with(&[10, 20, 30]);
        let now = Utc::now();

        keeper.reserve("acc", &NATIVE_ASSET_ID, 30, &[], now + Duration::seconds(10)).unwrap();
        keeper.reserve("acc", &NATIVE_ASSET_ID, 20, &[], now + Duration::seconds(100)).unwrap();

        assert_eq!(keeper.sweep_expired(now), 0);
        assert_eq!(keeper.sweep_expired(now + Duration::seconds(50)), 1);
        assert_eq!(keeper.reservation_count(), 1);
        assert_eq!(keeper.sweep_expired(now + Duration::seconds(500)), 1);
        assert_eq!(keeper.reserved_count(), 0);
    }

    #[test]
    fn test_reserve_particular() {
        let keeper = keeper_with(&[10, 20]);
        let target = Hash::from_u64(0);

        let res = keeper.reserve_particular(&target, later()).unwrap();
        assert_eq!(res.utxos.len(), 1);
        assert_eq!(res.total, 10);

        let err = keeper.reserve_particular(&target, later()).unwrap_err();
        assert!(matches!(err, KeeperError::Reserved { .. }));

        let err = keeper.reserve_particular(&Hash::from_u64(99), later()).unwrap_err();
        assert!(matches!(err, KeeperError::NotFound(id) if id == Hash::from_u64(99)));

        keeper.cancel(&res.id);
        assert!(keeper.reserve_particular(&target, later()).is_ok());
    }

    #[test]
    fn test_remove_utxo_drops_it_from_reservation() {
        let keeper = keeper_with(&[10, 20]);
        let res = keeper.reserve("acc", &NATIVE_ASSET_ID, 30, &[], later()).unwrap();

        keeper.remove_utxo(&Hash::from_u64(1)).unwrap();
        let reservation = keeper.reservation(&res.id).unwrap();
        assert_eq!(reservation.utxos, vec![Hash::from_u64(0)]);

        keeper.remove_utxo(&Hash::from_u64(0)).unwrap();
        assert!(keeper.reservation(&res.id).is_none());
        assert_eq!(keeper.utxo_count(), 0);
        assert_eq!(keeper.reserved_count(), 0);
    }

    #[test]
    fn test_hydrate_from_store() {
        let store: MemoryUtxoStore = [
            utxo(1, "acc", NATIVE_ASSET_ID, 10),
            utxo(2, "acc", NATIVE_ASSET_ID, 20),
            utxo(3, "other", NATIVE_ASSET_ID, 30),
        ]
        .into_iter()
        .collect();

        let keeper = UtxoKeeper::new();
        assert_eq!(keeper.hydrate(&store, Some("acc")).unwrap(), 2);
        assert_eq!(keeper.hydrate(&store, None).unwrap(), 1);
        assert_eq!(keeper.hydrate(&store, None).unwrap(), 0);
        assert_eq!(keeper.balance("acc", &NATIVE_ASSET_ID).free, 30);
    }

    #[test]
    fn test_concurrent_reservations_never_overlap() {
        let amounts: Vec<u64> = (1..=64).collect();
        let keeper = Arc::new(keeper_with(&amounts));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let keeper = Arc::clone(&keeper);
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Ok(res) = keeper.reserve("acc", &NATIVE_ASSET_ID, 50, &[], later()) {
                        taken.extend(res.utxos.into_iter().map(|u| u.output_id));
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<OutputId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let count = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), count, "an output was reserved twice");
        assert_eq!(keeper.reserved_count(), count);
    }

    #[test]
    fn test_amounts_near_u64_max() {
        let keeper = keeper_with(&[u64::MAX - 1, 5]);
        assert_eq!(keeper.balance("acc", &NATIVE_ASSET_ID).free, u64::MAX);

        let err = keeper.reserve("acc", &NATIVE_ASSET_ID, u64::MAX, &[], later()).unwrap_err();
        assert!(matches!(err, KeeperError::InvalidAmount(_)));
        assert_eq!(keeper.reservation_count(), 0);

        let res = keeper.reserve("acc", &NATIVE_ASSET_ID, u64::MAX - 1, &[], later()).unwrap();
        assert_eq!(res.total, u64::MAX - 1);
        assert_eq!(res.change, 0);

        let balance = keeper.balance("acc", &NATIVE_ASSET_ID);
        assert_eq!(balance, Balance { free: 5, reserved: u64::MAX - 1 });
        assert_eq!(balance.total(), u64::MAX);

        let err = keeper.reserve("acc", &NATIVE_ASSET_ID, u64::MAX, &[], later()).unwrap_err();
        assert!(matches!(err, KeeperError::Reserved { free: 5, .. }));
    }

    #[test]
    fn test_zero_amount_utxo_is_not_added() {
        let keeper = UtxoKeeper::new();
        assert!(!keeper.add_utxo(utxo(1, "acc", NATIVE_ASSET_ID, 0)));
        assert_eq!(keeper.utxo_count(), 0);
        assert!(matches!(
            keeper.reserve_particular(&Hash::from_u64(1), later()),
            Err(KeeperError::NotFound(_))
        ));
    }
}

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{OutputId, Utxo, UtxoKey};

/// Opaque reservation handle.
pub type ReservationId = Uuid;

/// A time-bounded lock over a set of UTXOs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub key: UtxoKey,
    pub utxos: Vec<OutputId>,
    pub total: u64,
    /// Amount selected above the request, to be returned as change by the caller
    pub change: u64,
    pub expiry: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry < now
    }
}

/// The result of a successful `reserve` call.
#[derive(Debug, Clone)]
pub struct ReservedUtxos {
    pub id: ReservationId,
    /// Selected UTXOs, largest first
    pub utxos: Vec<Utxo>,
    pub total: u64,
    pub change: u64,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub free: u64,
    pub reserved: u64,
}

impl Balance {
    pub fn total(&self) -> u64 {
        self.free.saturating_add(self.reserved)
    }
}

/// Point-in-time copy of the keeper's partition and reservation table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeeperSnapshot {
    pub pool: BTreeSet<OutputId>,
    pub reserved: BTreeMap<OutputId, ReservationId>,
    pub reservations: BTreeMap<ReservationId, Reservation>,
}

impl KeeperSnapshot {
    pub fn free(&self) -> BTreeSet<OutputId> {
        self.pool
            .iter()
            .filter(|id| !self.reserved.contains_key(id))
            .copied()
            .collect()
    }
}

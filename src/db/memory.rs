use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use super::{UtxoStore, WalletDbError, WalletDbResult};
use crate::models::{OutputId, Utxo};

/// Store backed by an ordered map.
#[derive(Default)]
pub struct MemoryUtxoStore {
    records: RwLock<BTreeMap<OutputId, Utxo>>,
}

impl MemoryUtxoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FromIterator<Utxo> for MemoryUtxoStore {
    fn from_iter<I: IntoIterator<Item = Utxo>>(iter: I) -> Self {
        Self {
            records: RwLock::new(iter.into_iter().map(|u| (u.output_id, u)).collect()),
        }
    }
}

impl UtxoStore for MemoryUtxoStore {
    fn get(&self, output_id: &OutputId) -> WalletDbResult<Option<Utxo>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(output_id).cloned())
    }

    fn set(&self, utxo: &Utxo) -> WalletDbResult<()> {
        if utxo.amount == 0 {
            return Err(WalletDbError::InvalidInput(format!(
                "UTXO {} has a zero amount",
                utxo.output_id
            )));
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(utxo.output_id, utxo.clone());
        Ok(())
    }

    fn delete(&self, output_id: &OutputId) -> WalletDbResult<bool> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Ok(records.remove(output_id).is_some())
    }

    fn iterate(&self, account_id: Option<&str>) -> WalletDbResult<Vec<Utxo>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .values()
            .filter(|u| account_id.is_none_or(|account| u.account_id == account))
            .cloned()
            .collect())
    }
}

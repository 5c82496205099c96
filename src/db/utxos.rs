use log::debug;
use rusqlite::{OptionalExtension, named_params};
use serde::Deserialize;
use serde_rusqlite::from_rows;

use super::{SqlitePool, UtxoStore, WalletDbError, WalletDbResult};
use crate::models::{OutputId, Utxo};

/// UTXO records stored as JSON in the `utxos` table.
#[derive(Clone)]
pub struct SqliteUtxoStore {
    pool: SqlitePool,
}

#[derive(Deserialize)]
struct UtxoRow {
    record_json: String,
}

impl UtxoRow {
    fn into_utxo(self) -> WalletDbResult<Utxo> {
        Ok(serde_json::from_str(&self.record_json)?)
    }
}

impl SqliteUtxoStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl UtxoStore for SqliteUtxoStore {
    fn get(&self, output_id: &OutputId) -> WalletDbResult<Option<Utxo>> {
        let conn = self.pool.get()?;
        let record_json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM utxos WHERE output_id = :id",
                named_params! { ":id": output_id.to_hex() },
                |row| row.get(0),
            )
            .optional()?;

        record_json
            .map(|record_json| UtxoRow { record_json }.into_utxo())
            .transpose()
    }

    fn set(&self, utxo: &Utxo) -> WalletDbResult<()> {
        if utxo.amount == 0 {
            return Err(WalletDbError::InvalidInput(format!(
                "UTXO {} has a zero amount",
                utxo.output_id
            )));
        }
        let amount = i64::try_from(utxo.amount)
            .map_err(|_| WalletDbError::InvalidInput(format!("UTXO amount {} out of range", utxo.amount)))?;

        debug!(
            output_id:% = utxo.output_id,
            account_id = utxo.account_id.as_str();
            "DB: Storing UTXO"
        );

        let record_json = serde_json::to_string(utxo)?;
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO utxos (output_id, account_id, asset_id, amount, record_json)
            VALUES (:id, :account, :asset, :amount, :record)
            ON CONFLICT(output_id) DO UPDATE SET
                account_id = excluded.account_id,
                asset_id = excluded.asset_id,
                amount = excluded.amount,
                record_json = excluded.record_json
            "#,
            named_params! {
                ":id": utxo.output_id.to_hex(),
                ":account": utxo.account_id,
                ":asset": utxo.asset_id.to_hex(),
                ":amount": amount,
                ":record": record_json,
            },
        )?;

        Ok(())
    }

    fn delete(&self, output_id: &OutputId) -> WalletDbResult<bool> {
        let conn = self.pool.get()?;
        let count = conn.execute(
            "DELETE FROM utxos WHERE output_id = :id",
            named_params! { ":id": output_id.to_hex() },
        )?;
        Ok(count > 0)
    }

    fn iterate(&self, account_id: Option<&str>) -> WalletDbResult<Vec<Utxo>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT record_json
            FROM utxos
            WHERE :account IS NULL OR account_id = :account
            ORDER BY output_id ASC
            "#,
        )?;

        let rows = stmt.query(named_params! { ":account": account_id })?;
        from_rows::<UtxoRow>(rows)
            .map(|row| row.map_err(WalletDbError::from).and_then(UtxoRow::into_utxo))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::{Hash, NATIVE_ASSET_ID};
    use tempfile::tempdir;

    fn utxo(id: u64, account: &str, amount: u64) -> Utxo {
        Utxo {
            output_id: Hash::from_u64(id),
            source_id: Hash::from_u64(2),
            source_pos: 0,
            asset_id: NATIVE_ASSET_ID,
            amount,
            account_id: account.to_string(),
            control_program: vec![0x51],
            address: format!("addr-{id}"),
            control_program_index: id,
            change: false,
        }
    }

    #[test]
    fn test_utxo_store_lifecycle() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let pool = init_db(temp_dir.path().join("utxos.db")).expect("Failed to init DB");
        let store = SqliteUtxoStore::new(pool);

        store.set(&utxo(3, "alice", 300)).unwrap();
        store.set(&utxo(1, "alice", 100)).unwrap();
        store.set(&utxo(2, "bob", 200)).unwrap();

        let fetched = store.get(&Hash::from_u64(1)).unwrap().expect("UTXO not found");
        assert_eq!(fetched, utxo(1, "alice", 100));
        assert!(store.get(&Hash::from_u64(9)).unwrap().is_none());

        let alice: Vec<u64> = store.iterate(Some("alice")).unwrap().iter().map(|u| u.amount).collect();
        assert_eq!(alice, vec![100, 300]);
        assert_eq!(store.iterate(None).unwrap().len(), 3);

        // Overwrite keeps a single row
        store.set(&utxo(1, "alice", 150)).unwrap();
        assert_eq!(store.get(&Hash::from_u64(1)).unwrap().unwrap().amount, 150);
        assert_eq!(store.iterate(None).unwrap().len(), 3);

        assert!(store.delete(&Hash::from_u64(1)).unwrap());
        assert!(!store.delete(&Hash::from_u64(1)).unwrap());
        assert_eq!(store.iterate(Some("alice")).unwrap().len(), 1);
    }

    #[test]
    fn test_zero_amount_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteUtxoStore::new(init_db(temp_dir.path().join("zero.db")).unwrap());

        let err = store.set(&utxo(1, "alice", 0)).unwrap_err();
        assert!(matches!(err, WalletDbError::InvalidInput(_)));
    }
}

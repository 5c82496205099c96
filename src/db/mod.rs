//! Durable UTXO storage.
//!
//! The keeper never touches storage while holding its lock: a [`UtxoStore`] is read once to
//! hydrate the keeper's free index, and written when outputs are confirmed or spent.
//!
//! Two implementations are provided:
//!
//! - [`SqliteUtxoStore`] - records kept as JSON in a SQLite table behind an r2d2 pool
//! - [`MemoryUtxoStore`] - a map guarded by a lock, for tests and embedding

use std::path::Path;

use include_dir::{Dir, include_dir};
use log::{debug, info};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite_migration::Migrations;

use crate::models::{OutputId, Utxo};

mod error;
pub use error::{WalletDbError, WalletDbResult};

mod memory;
pub use memory::MemoryUtxoStore;

mod utxos;
pub use utxos::SqliteUtxoStore;

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

static MIGRATIONS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/migrations");

/// Key-value access to serialized UTXO records, keyed by output id.
pub trait UtxoStore: Send + Sync {
    fn get(&self, output_id: &OutputId) -> WalletDbResult<Option<Utxo>>;

    /// Inserts or replaces the record stored under `utxo.output_id`.
    fn set(&self, utxo: &Utxo) -> WalletDbResult<()>;

    /// Returns `true` if a record was removed.
    fn delete(&self, output_id: &OutputId) -> WalletDbResult<bool>;

    /// All records, optionally restricted to one account, ordered by output id.
    fn iterate(&self, account_id: Option<&str>) -> WalletDbResult<Vec<Utxo>>;
}

pub fn init_db<P: AsRef<Path>>(db_path: P) -> WalletDbResult<SqlitePool> {
    let path = db_path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
    });
    let pool = r2d2::Pool::builder().max_size(5).build(manager)?;

    let mut conn = pool.get()?;
    let migrations = Migrations::from_directory(&MIGRATIONS_DIR)?;
    migrations.to_latest(&mut conn)?;
    debug!(path:% = path.display(); "DB: Migrations applied");

    info!(path:% = path.display(); "Database initialized");
    Ok(pool)
}

use std::path::PathBuf;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{chain::ChainConfig, cli::ApplyArgs, cli::DatabaseArgs, cli::KeeperArgs};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub database_path: PathBuf,
    /// Hard limit on inputs per transaction; larger spends are chained
    pub max_inputs_per_tx: usize,
    pub reservation_ttl_secs: u64,
    /// Native-asset amount deducted by each intermediate chain transaction
    pub chain_merge_fee: u64,
    pub sweep_interval_secs: u64,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/utxos.db"),
            max_inputs_per_tx: 10,
            reservation_ttl_secs: 300,
            chain_merge_fee: 10_000_000,
            sweep_interval_secs: 60,
        }
    }
}

impl KeeperConfig {
    pub const SECTION: &'static str = "keeper";
    pub const MAX_RESERVATION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_inputs_per_tx >= 2,
            "max_inputs_per_tx must be at least 2 to allow chaining, got {}",
            self.max_inputs_per_tx
        );
        ensure!(
            self.reservation_ttl_secs > 0 && self.reservation_ttl_secs <= Self::MAX_RESERVATION_TTL_SECS,
            "reservation_ttl_secs must be between 1 and {}, got {}",
            Self::MAX_RESERVATION_TTL_SECS,
            self.reservation_ttl_secs
        );
        ensure!(self.sweep_interval_secs > 0, "sweep_interval_secs must be positive");
        Ok(())
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        let secs = self.reservation_ttl_secs.min(Self::MAX_RESERVATION_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            max_inputs: self.max_inputs_per_tx,
            merge_fee: self.chain_merge_fee,
        }
    }
}

impl ApplyArgs for KeeperConfig {
    fn apply_database(&mut self, args: &DatabaseArgs) {
        if let Some(database_path) = &args.database_path {
            self.database_path = database_path.clone();
        }
    }

    fn apply_keeper(&mut self, args: &KeeperArgs) {
        if let Some(max_inputs) = args.max_inputs_per_tx {
            self.max_inputs_per_tx = max_inputs;
        }
        if let Some(ttl) = args.reservation_ttl_secs {
            self.reservation_ttl_secs = ttl;
        }
        if let Some(interval) = args.sweep_interval_secs {
            self.sweep_interval_secs = interval;
        }
    }
}

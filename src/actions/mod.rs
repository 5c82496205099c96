//! Spend actions and the transaction builder they contribute to.
//!
//! An [`Action`] is either a generic spend, resolved against the keeper's pool at build
//! time, or a spend of one named UTXO. Generic spends for the same (account, asset) are
//! merged before anything is reserved, so one key is only ever selected once per build.

use std::{collections::HashMap, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    chain::{ChainBuilder, ChainConfig},
    config::KeeperConfig,
    keeper::{KeeperError, UtxoKeeper},
    models::{AssetId, HashParseError, OutputId, TxOutput, UtxoKey},
};

mod builder;
pub use builder::{BuiltTransaction, TemplateBuilder};

/// Spend `amount` of `asset_id` from `account_id`, from whichever UTXOs the keeper selects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendAction {
    pub account_id: String,
    pub asset_id: AssetId,
    pub amount: u64,
}

impl SpendAction {
    pub fn key(&self) -> UtxoKey {
        UtxoKey::new(&self.account_id, self.asset_id)
    }
}

/// Spend exactly the named UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendUtxoAction {
    pub output_id: OutputId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Spend(SpendAction),
    SpendUtxo(SpendUtxoAction),
}

#[derive(Debug, Error)]
pub enum ActionParseError {
    #[error("Expected 'account:asset:amount' or 'utxo:<output_id>', got '{0}'")]
    Format(String),
    #[error("Invalid id: {0}")]
    Id(#[from] HashParseError),
    #[error("Invalid amount '{0}'")]
    Amount(String),
}

impl FromStr for Action {
    type Err = ActionParseError;

    /// Parses `utxo:<output_id>` or `<account>:<asset>:<amount>`. The account id may itself
    /// contain ':'.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(output_id) = s.strip_prefix("utxo:") {
            return Ok(Action::SpendUtxo(SpendUtxoAction {
                output_id: output_id.parse()?,
            }));
        }

        let mut parts = s.rsplitn(3, ':');
        let (Some(amount), Some(asset), Some(account)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ActionParseError::Format(s.to_string()));
        };
        if account.is_empty() {
            return Err(ActionParseError::Format(s.to_string()));
        }
        let amount = amount
            .parse::<u64>()
            .map_err(|_| ActionParseError::Amount(amount.to_string()))?;

        Ok(Action::Spend(SpendAction {
            account_id: account.to_string(),
            asset_id: asset.parse()?,
            amount,
        }))
    }
}

/// Collapses generic spends sharing an (account, asset) key into one spend of the summed
/// amount, placed where the key was first seen. UTXO spends pass through in their original
/// relative order. A lone action comes back unchanged.
pub fn merge_spend_actions(actions: &[Action]) -> Vec<Action> {
    let mut merged: Vec<Action> = Vec::with_capacity(actions.len());
    let mut positions: HashMap<UtxoKey, usize> = HashMap::new();

    for action in actions {
        match action {
            Action::Spend(spend) => {
                if let Some(&pos) = positions.get(&spend.key()) {
                    if let Action::Spend(existing) = &mut merged[pos] {
                        existing.amount = existing.amount.saturating_add(spend.amount);
                    }
                } else {
                    positions.insert(spend.key(), merged.len());
                    merged.push(action.clone());
                }
            },
            Action::SpendUtxo(_) => merged.push(action.clone()),
        }
    }

    merged
}

/// Everything an action needs to contribute to a transaction.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub keeper: &'a UtxoKeeper,
    pub chain: ChainConfig,
    pub ttl: Duration,
}

impl<'a> BuildContext<'a> {
    pub fn new(keeper: &'a UtxoKeeper, config: &KeeperConfig) -> Self {
        Self {
            keeper,
            chain: config.chain_config(),
            ttl: config.reservation_ttl(),
        }
    }
}

impl Action {
    /// Reserves what this action spends and adds it to `builder`.
    ///
    /// Reservations are registered with the builder as soon as they are taken; on error
    /// the caller rolls back the builder.
    pub fn build(&self, ctx: &BuildContext<'_>, builder: &mut TemplateBuilder) -> Result<(), KeeperError> {
        match self {
            Action::Spend(spend) => {
                let chained = ChainBuilder::new(ctx.keeper, ctx.chain).build_chained(
                    &spend.account_id,
                    &spend.asset_id,
                    spend.amount,
                    builder.deadline(),
                    ctx.ttl,
                )?;
                builder.on_rollback(chained.reservations);
                builder.add_chain(chained.templates);
                for utxo in &chained.inputs {
                    builder.add_input(utxo);
                }
                if chained.change > 0 {
                    if let Some(first) = chained.inputs.first() {
                        builder.add_output(TxOutput {
                            asset_id: spend.asset_id,
                            amount: chained.change,
                            control_program: first.control_program.clone(),
                        });
                    }
                }
                debug!(
                    key:% = chained.key,
                    inputs = chained.inputs.len(),
                    change_present = chained.change > 0;
                    "Action: Spend added"
                );
            },
            Action::SpendUtxo(spend) => {
                let reserved = ctx
                    .keeper
                    .reserve_particular(&spend.output_id, builder.expiry(ctx.ttl))?;
                builder.on_rollback([reserved.id]);
                for utxo in &reserved.utxos {
                    builder.add_input(utxo);
                }
                debug!(output_id:% = spend.output_id; "Action: UTXO spend added");
            },
        }
        Ok(())
    }
}

/// Merges `actions`, builds each into one transaction with the extra `outputs`, and
/// returns the templates to sign.
///
/// On any failure every reservation taken for this transaction is released before the
/// error is returned.
pub fn build_transaction(
    ctx: &BuildContext<'_>,
    actions: &[Action],
    outputs: Vec<TxOutput>,
    deadline: Option<DateTime<Utc>>,
) -> Result<BuiltTransaction, KeeperError> {
    let mut builder = TemplateBuilder::new(ctx.chain.max_inputs, deadline);
    for output in outputs {
        builder.add_output(output);
    }

    for action in merge_spend_actions(actions) {
        if let Err(e) = action.build(ctx, &mut builder) {
            warn!(error:% = e; "Build: Action failed, rolling back");
            builder.rollback(ctx.keeper);
            return Err(e);
        }
    }

    match builder.build() {
        Ok(templates) => {
            info!(
                templates = templates.len(),
                inputs = builder.input_count();
                "Build: Transaction built"
            );
            Ok(BuiltTransaction {
                templates,
                reservations: builder.into_reservations(),
            })
        },
        Err(e) => {
            warn!(error:% = e; "Build: Final transaction rejected, rolling back");
            builder.rollback(ctx.keeper);
            Err(e)
        },
    }
}

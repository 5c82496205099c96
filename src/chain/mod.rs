//! Chained transaction construction.
//!
//! A transaction may carry at most `max_inputs` inputs. When a spend needs more UTXOs than
//! that, the [`ChainBuilder`] merges them through a chain of intermediate transactions:
//!
//! ```text
//!   [u0 .. u9] ──> s1
//!   [s1, u10 .. u18] ──> s2
//!   [s2, u19 ..]  (caller's transaction)
//! ```
//!
//! Each link has a single output paying `sum(inputs) - merge_fee` back to the spending
//! account. That output is not confirmed yet but is used as the first input of the next
//! link within the same build attempt. Inputs are consumed largest first, so the early
//! links carry most of the value.
//!
//! Every reservation taken while building is tracked by a [`Rollback`]; if any step fails
//! they are all released before the error is returned.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::{
    actions::{Action, merge_spend_actions},
    keeper::{KeeperError, ReservationId, UtxoKeeper, selection::sort_for_selection},
    models::{AssetId, NATIVE_ASSET_ID, TemplateKey, Transaction, TxInput, TxOutput, TxTemplate, Utxo, UtxoKey},
};

mod rollback;
pub use rollback::Rollback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    /// Maximum inputs per transaction
    pub max_inputs: usize,
    /// Native-asset amount deducted by every intermediate link
    pub merge_fee: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_inputs: 10,
            merge_fee: 10_000_000,
        }
    }
}

impl ChainConfig {
    /// Number of intermediate links needed to spend `inputs` UTXOs.
    ///
    /// The first link takes `max_inputs` UTXOs and every further one takes the previous
    /// link's output plus `max_inputs - 1` UTXOs, until the last output plus the remaining
    /// UTXOs fit into the caller's transaction.
    pub fn links_for(&self, inputs: usize) -> usize {
        if inputs <= self.max_inputs || self.max_inputs < 2 {
            return 0;
        }
        (inputs - 1).div_ceil(self.max_inputs - 1) - 1
    }

    /// Fee paid in `asset_id` by the links needed for `inputs` UTXOs.
    pub fn fee_for(&self, asset_id: &AssetId, inputs: usize) -> u64 {
        self.link_fee(asset_id).saturating_mul(self.links_for(inputs) as u64)
    }

    fn link_fee(&self, asset_id: &AssetId) -> u64 {
        if *asset_id == NATIVE_ASSET_ID { self.merge_fee } else { 0 }
    }
}

/// Result of a successful chained build for one (account, asset) key.
#[derive(Debug, Clone)]
pub struct ChainedSpend {
    pub key: UtxoKey,
    pub amount: u64,
    /// Intermediate merge transactions in construction order
    pub templates: Vec<TxTemplate>,
    /// Inputs for the transaction that fulfils the spend: the last link's output first,
    /// then the UTXOs no link consumed
    pub inputs: Vec<Utxo>,
    /// Sum of `inputs`
    pub total: u64,
    pub change: u64,
    /// Reservations held by this build; cancel them to abandon it
    pub reservations: Vec<ReservationId>,
}

pub struct ChainBuilder<'a> {
    keeper: &'a UtxoKeeper,
    config: ChainConfig,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(keeper: &'a UtxoKeeper, config: ChainConfig) -> Self {
        Self { keeper, config }
    }

    /// Reserves UTXOs for `amount` of `asset_id` from `account_id` and chains them if they
    /// exceed the per-transaction input limit.
    ///
    /// All reservations expire at `deadline`, or `now + ttl` when no deadline is given.
    ///
    /// # Errors
    ///
    /// Any keeper error is returned unchanged after every reservation of this attempt has
    /// been released.
    pub fn build_chained(
        &self,
        account_id: &str,
        asset_id: &AssetId,
        amount: u64,
        deadline: Option<DateTime<Utc>>,
        ttl: Duration,
    ) -> Result<ChainedSpend, KeeperError> {
        if self.config.max_inputs < 2 {
            return Err(KeeperError::ChainLimitExceeded {
                inputs: 2,
                limit: self.config.max_inputs,
            });
        }
        let key = UtxoKey::new(account_id, *asset_id);
        let expiry = deadline.unwrap_or_else(|| Utc::now() + ttl);

        let mut rollback = Rollback::new(self.keeper);
        let built = self
            .reserve_chain(&mut rollback, &key, amount, expiry)
            .and_then(|utxos| self.link(&key, utxos))
            .and_then(|(templates, inputs)| sum_amounts(&key, &inputs).map(|total| (templates, inputs, total)));

        let (templates, inputs, total) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!(key:% = key, error:% = e; "Chain: Build failed, rolling back");
                rollback.rollback();
                return Err(e);
            },
        };

        let reservations = rollback.commit();
        info!(
            key:% = key,
            links = templates.len(),
            inputs = inputs.len(),
            reservations = reservations.len();
            "Chain: Spend built"
        );

        Ok(ChainedSpend {
            key,
            amount,
            templates,
            inputs,
            total,
            change: total.saturating_sub(amount),
            reservations,
        })
    }

    /// Runs `build_chained` for every generic spend in the merged `actions` and returns the
    /// chain templates per key. Explicit UTXO spends are not chained and are skipped.
    ///
    /// If any key fails, the reservations of all keys are released.
    pub fn merge_spend_action_utxo(
        &self,
        actions: &[Action],
        deadline: Option<DateTime<Utc>>,
        ttl: Duration,
    ) -> Result<HashMap<TemplateKey, Vec<TxTemplate>>, KeeperError> {
        let mut rollback = Rollback::new(self.keeper);
        let mut templates = HashMap::new();

        for action in merge_spend_actions(actions) {
            let Action::Spend(spend) = action else {
                continue;
            };
            match self.build_chained(&spend.account_id, &spend.asset_id, spend.amount, deadline, ttl) {
                Ok(chained) => {
                    rollback.extend(chained.reservations);
                    templates.insert(chained.key, chained.templates);
                },
                Err(e) => {
                    rollback.rollback();
                    return Err(e);
                },
            }
        }

        rollback.commit();
        Ok(templates)
    }

    /// Reserves until the reserved total covers `amount` plus the merge fee for the number
    /// of UTXOs reserved so far. The fee grows with the input count, so this may take
    /// several rounds.
    fn reserve_chain(
        &self,
        rollback: &mut Rollback<'_>,
        key: &UtxoKey,
        amount: u64,
        expiry: DateTime<Utc>,
    ) -> Result<Vec<Utxo>, KeeperError> {
        let mut utxos = Vec::new();
        let mut reserved = 0u64;
        let mut fee = 0u64;

        loop {
            let required = amount
                .checked_add(fee)
                .ok_or_else(|| KeeperError::InvalidAmount(format!("{amount} plus fee {fee} overflows")))?;
            if reserved >= required {
                break;
            }

            let res = self
                .keeper
                .reserve(&key.account_id, &key.asset_id, required - reserved, &[], expiry)
                .map_err(|e| with_required(e, required))?;
            rollback.track(res.id);
            reserved = reserved.saturating_add(res.total);
            utxos.extend(res.utxos);
            fee = self.config.fee_for(&key.asset_id, utxos.len());

            debug!(key:% = key, utxos = utxos.len(), fee = fee; "Chain: Reservation round complete");
        }

        Ok(utxos)
    }

    fn link(&self, key: &UtxoKey, mut utxos: Vec<Utxo>) -> Result<(Vec<TxTemplate>, Vec<Utxo>), KeeperError> {
        sort_for_selection(&mut utxos);
        let Some(owner) = utxos.first().cloned() else {
            return Ok((Vec::new(), Vec::new()));
        };

        let limit = self.config.max_inputs;
        let fee = self.config.link_fee(&key.asset_id);
        let mut templates = Vec::new();
        let mut carry: Option<Utxo> = None;
        let mut rest = utxos.as_slice();

        while usize::from(carry.is_some()) + rest.len() > limit {
            let (batch, tail) = rest.split_at(limit - usize::from(carry.is_some()));
            let inputs: Vec<Utxo> = carry.take().into_iter().chain(batch.iter().cloned()).collect();

            let template = self.merge_link(key, &inputs, fee, &owner)?;
            carry = Some(
                template
                    .output_as_utxo(0, &owner)
                    .ok_or(KeeperError::ChainLimitExceeded { inputs: inputs.len(), limit })?,
            );

            debug!(
                key:% = key,
                link = templates.len(),
                tx_id:% = template.tx_id,
                inputs = inputs.len();
                "Chain: Built merge transaction"
            );
            templates.push(template);
            rest = tail;
        }

        let inputs: Vec<Utxo> = carry.into_iter().chain(rest.iter().cloned()).collect();
        if inputs.len() > limit {
            return Err(KeeperError::ChainLimitExceeded {
                inputs: inputs.len(),
                limit,
            });
        }
        Ok((templates, inputs))
    }

    fn merge_link(&self, key: &UtxoKey, inputs: &[Utxo], fee: u64, owner: &Utxo) -> Result<TxTemplate, KeeperError> {
        if inputs.len() > self.config.max_inputs {
            return Err(KeeperError::ChainLimitExceeded {
                inputs: inputs.len(),
                limit: self.config.max_inputs,
            });
        }

        let sum = sum_amounts(key, inputs)?;
        let out = sum
            .checked_sub(fee)
            .filter(|out| *out > 0)
            .ok_or_else(|| KeeperError::Insufficient {
                key: key.clone(),
                available: sum,
                required: fee.saturating_add(1),
            })?;

        Ok(TxTemplate::new(Transaction {
            inputs: inputs.iter().map(TxInput::from).collect(),
            outputs: vec![TxOutput {
                asset_id: key.asset_id,
                amount: out,
                control_program: owner.control_program.clone(),
            }],
        }))
    }
}

fn sum_amounts(key: &UtxoKey, utxos: &[Utxo]) -> Result<u64, KeeperError> {
    utxos
        .iter()
        .try_fold(0u64, |acc, u| acc.checked_add(u.amount))
        .ok_or_else(|| KeeperError::InvalidAmount(format!("inputs for {key} sum to more than {}", u64::MAX)))
}

/// A later reservation round only asks for the shortfall; report the whole requirement.
fn with_required(err: KeeperError, total_required: u64) -> KeeperError {
    match err {
        KeeperError::Insufficient { key, available, .. } => KeeperError::Insufficient {
            key,
            available,
            required: total_required,
        },
        KeeperError::Reserved { key, free, reserved, .. } => KeeperError::Reserved {
            key,
            free,
            reserved,
            required: total_required,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Hash;

    fn keeper_with(asset: AssetId, amounts: &[u64]) -> UtxoKeeper {
        let keeper = UtxoKeeper::new();
        for (i, amount) in amounts.iter().enumerate() {
            keeper.add_utxo(Utxo {
                output_id: Hash::from_u64(i as u64),
                source_id: Hash::from_u64(2),
                source_pos: 0,
                asset_id: asset,
                amount: *amount,
                account_id: "acc".into(),
                control_program: vec![0x00, 0x14],
                address: "addr".into(),
                control_program_index: 1,
                change: false,
            });
        }
        keeper
    }

    fn ttl() -> Duration {
        Duration::minutes(5)
    }

    #[test]
    fn links_for_matches_chain_shape() {
        let config = ChainConfig {
            max_inputs: 10,
            merge_fee: 1,
        };
        assert_eq!(config.links_for(0), 0);
        assert_eq!(config.links_for(10), 0);
        assert_eq!(config.links_for(11), 1);
        assert_eq!(config.links_for(19), 1);
        assert_eq!(config.links_for(20), 2);
        assert_eq!(config.links_for(28), 2);
        assert_eq!(config.links_for(29), 3);
    }

    #[test]
    fn fee_only_applies_to_native_asset() {
        let config = ChainConfig::default();
        assert_eq!(config.fee_for(&NATIVE_ASSET_ID, 22), 20_000_000);
        assert_eq!(config.fee_for(&Hash::from_u64(5), 22), 0);
    }

    #[test]
    fn small_spend_needs_no_chain() {
        let keeper = keeper_with(NATIVE_ASSET_ID, &[500, 300, 200]);
        let builder = ChainBuilder::new(&keeper, ChainConfig::default());

        let spend = builder
            .build_chained("acc", &NATIVE_ASSET_ID, 600, None, ttl())
            .unwrap();
        assert!(spend.templates.is_empty());
        assert_eq!(spend.inputs.len(), 2);
        assert_eq!(spend.total, 800);
        assert_eq!(spend.change, 200);
        assert_eq!(spend.reservations.len(), 1);
    }

    #[test]
    fn every_template_respects_the_cap() {
        let amounts: Vec<u64> = (1..=40).map(|i| i * 1_000).collect();
        let asset = Hash::from_u64(77);
        let keeper = keeper_with(asset, &amounts);
        let config = ChainConfig {
            max_inputs: 4,
            merge_fee: 0,
        };
        let builder = ChainBuilder::new(&keeper, config);

        let total: u64 = amounts.iter().sum();
        let spend = builder.build_chained("acc", &asset, total, None, ttl()).unwrap();

        assert_eq!(spend.templates.len(), config.links_for(40));
        for template in &spend.templates {
            assert!(template.input_count() <= 4);
            assert_eq!(template.transaction.outputs.len(), 1);
        }
        assert!(spend.inputs.len() <= 4);
        assert_eq!(spend.total, total);
        assert_eq!(spend.change, 0);
    }

    #[test]
    fn each_link_spends_the_previous_output() {
        let amounts: Vec<u64> = vec![100; 25];
        let keeper = keeper_with(NATIVE_ASSET_ID, &amounts);
        let builder = ChainBuilder::new(
            &keeper,
            ChainConfig {
                max_inputs: 10,
                merge_fee: 5,
            },
        );

        let spend = builder
            .build_chained("acc", &NATIVE_ASSET_ID, 2_400, None, ttl())
            .unwrap();

        assert_eq!(spend.templates.len(), 2);
        let first = &spend.templates[0];
        let second = &spend.templates[1];
        assert_eq!(first.transaction.outputs[0].amount, 995);
        assert_eq!(second.transaction.inputs[0].output_id, first.result_ids[0]);
        assert_eq!(second.transaction.inputs[0].amount, 995);
        assert_eq!(spend.inputs[0].output_id, second.result_ids[0]);
        assert_eq!(spend.inputs[0].source_id, second.tx_id);
        // 25 UTXOs minus two fees
        assert_eq!(spend.total, 2_490);
    }

    #[test]
    fn failure_releases_all_rounds() {
        let keeper = keeper_with(NATIVE_ASSET_ID, &[100; 12]);
        let builder = ChainBuilder::new(
            &keeper,
            ChainConfig {
                max_inputs: 10,
                merge_fee: 50,
            },
        );
        let before = keeper.snapshot();

        // 1160 takes all 12 UTXOs, and their single link costs 50 more than the pool holds
        let err = builder
            .build_chained("acc", &NATIVE_ASSET_ID, 1_160, None, ttl())
            .unwrap_err();
        // the error names the whole requirement, not the 10 missing in the second round
        assert!(matches!(err, KeeperError::Reserved { required: 1_210, .. }));
        assert_eq!(keeper.snapshot(), before);
    }

    #[test]
    fn overflowing_requirement_rolls_back_every_round() {
        let half = u64::MAX / 2;
        let keeper = keeper_with(NATIVE_ASSET_ID, &[half, half - 10, 8, 8]);
        let builder = ChainBuilder::new(
            &keeper,
            ChainConfig {
                max_inputs: 2,
                merge_fee: 10,
            },
        );
        let before = keeper.snapshot();

        // the second round saturates the reserved total, then amount plus fee overflows
        let err = builder
            .build_chained("acc", &NATIVE_ASSET_ID, u64::MAX - 10, None, ttl())
            .unwrap_err();
        assert!(matches!(err, KeeperError::InvalidAmount(_)));
        assert_eq!(keeper.snapshot(), before);
    }

    #[test]
    fn sum_amounts_rejects_overflow() {
        let key = UtxoKey::new("acc", NATIVE_ASSET_ID);
        let keeper = keeper_with(NATIVE_ASSET_ID, &[u64::MAX, 1]);
        let mut utxos = keeper
            .reserve("acc", &NATIVE_ASSET_ID, u64::MAX, &[], Utc::now() + ttl())
            .unwrap()
            .utxos;
        assert!(sum_amounts(&key, &utxos).is_ok());

        utxos.push(utxos[0].clone());
        assert!(matches!(sum_amounts(&key, &utxos), Err(KeeperError::InvalidAmount(_))));
    }

    #[test]
    fn explicit_deadline_applies_to_every_reservation() {
        let keeper = keeper_with(NATIVE_ASSET_ID, &[100; 15]);
        let builder = ChainBuilder::new(
            &keeper,
            ChainConfig {
                max_inputs: 5,
                merge_fee: 1,
            },
        );
        let deadline = Utc::now() + Duration::hours(2);

        let spend = builder
            .build_chained("acc", &NATIVE_ASSET_ID, 1_200, Some(deadline), ttl())
            .unwrap();
        assert!(spend.reservations.len() > 1);
        for id in &spend.reservations {
            assert_eq!(keeper.reservation(id).unwrap().expiry, deadline);
        }
    }

    #[test]
    fn cap_below_two_is_a_chain_limit_error() {
        let keeper = keeper_with(NATIVE_ASSET_ID, &[100]);
        let builder = ChainBuilder::new(
            &keeper,
            ChainConfig {
                max_inputs: 1,
                merge_fee: 0,
            },
        );
        let err = builder
            .build_chained("acc", &NATIVE_ASSET_ID, 50, None, ttl())
            .unwrap_err();
        assert!(matches!(err, KeeperError::ChainLimitExceeded { limit: 1, .. }));
        assert_eq!(keeper.reservation_count(), 0);
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{
    keeper::{KeeperError, ReservationId, UtxoKeeper},
    models::{Transaction, TxInput, TxOutput, TxTemplate, Utxo},
};

/// Collects the contributions of every action of one build attempt.
#[derive(Debug)]
pub struct TemplateBuilder {
    max_inputs: usize,
    deadline: Option<DateTime<Utc>>,
    chain: Vec<TxTemplate>,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    reservations: Vec<ReservationId>,
}

/// The templates of a finished build, in the order they must be signed and broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct BuiltTransaction {
    /// Chain links first; the last template spends the requested amounts
    pub templates: Vec<TxTemplate>,
    pub reservations: Vec<ReservationId>,
}

impl BuiltTransaction {
    pub fn final_template(&self) -> Option<&TxTemplate> {
        self.templates.last()
    }
}

impl TemplateBuilder {
    pub fn new(max_inputs: usize, deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            max_inputs,
            deadline,
            chain: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// The expiry reservations taken for this builder should carry.
    pub fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.deadline.unwrap_or_else(|| Utc::now() + ttl)
    }

    pub fn add_input(&mut self, utxo: &Utxo) {
        self.inputs.push(TxInput::from(utxo));
    }

    pub fn add_output(&mut self, output: TxOutput) {
        self.outputs.push(output);
    }

    pub fn add_chain(&mut self, templates: Vec<TxTemplate>) {
        self.chain.extend(templates);
    }

    pub fn on_rollback(&mut self, reservations: impl IntoIterator<Item = ReservationId>) {
        self.reservations.extend(reservations);
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// The chain links followed by the final transaction.
    ///
    /// # Errors
    ///
    /// `ChainLimitExceeded` if the final transaction would carry more inputs than allowed.
    pub fn build(&self) -> Result<Vec<TxTemplate>, KeeperError> {
        if self.inputs.len() > self.max_inputs {
            return Err(KeeperError::ChainLimitExceeded {
                inputs: self.inputs.len(),
                limit: self.max_inputs,
            });
        }
        let mut templates = self.chain.clone();
        templates.push(TxTemplate::new(Transaction {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }));
        Ok(templates)
    }

    pub fn into_reservations(self) -> Vec<ReservationId> {
        self.reservations
    }

    /// Releases every reservation taken by actions built into this builder.
    pub fn rollback(self, keeper: &UtxoKeeper) {
        for reservation_id in &self.reservations {
            keeper.cancel(reservation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Hash, NATIVE_ASSET_ID};

    fn utxo(id: u64, amount: u64) -> Utxo {
        Utxo {
            output_id: Hash::from_u64(id),
            source_id: Hash::from_u64(9),
            source_pos: 1,
            asset_id: NATIVE_ASSET_ID,
            amount,
            account_id: "acc".into(),
            control_program: vec![0xab],
            address: "addr".into(),
            control_program_index: 0,
            change: false,
        }
    }

    #[test]
    fn final_template_comes_last() {
        let link = TxTemplate::new(Transaction {
            inputs: vec![TxInput::from(&utxo(1, 10))],
            outputs: vec![],
        });
        let mut builder = TemplateBuilder::new(3, None);
        builder.add_chain(vec![link.clone()]);
        builder.add_input(&utxo(2, 20));
        builder.add_output(TxOutput {
            asset_id: NATIVE_ASSET_ID,
            amount: 20,
            control_program: vec![0xcd],
        });

        let templates = builder.build().unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0], link);
        assert_eq!(templates[1].input_amounts(), vec![20]);
        assert_eq!(templates[1].transaction.outputs[0].control_program, vec![0xcd]);
    }

    #[test]
    fn build_rejects_inputs_over_the_cap() {
        let mut builder = TemplateBuilder::new(2, None);
        for id in 0..3 {
            builder.add_input(&utxo(id, 5));
        }
        assert!(matches!(
            builder.build(),
            Err(KeeperError::ChainLimitExceeded { inputs: 3, limit: 2 })
        ));
    }

    #[test]
    fn expiry_prefers_the_deadline() {
        let deadline = Utc::now() + Duration::hours(1);
        assert_eq!(TemplateBuilder::new(2, Some(deadline)).expiry(Duration::seconds(5)), deadline);
        assert!(TemplateBuilder::new(2, None).expiry(Duration::seconds(5)) <= Utc::now() + Duration::seconds(5));
    }

    #[test]
    fn rollback_cancels_registered_reservations() {
        let keeper = UtxoKeeper::new();
        keeper.add_utxo(utxo(1, 10));
        keeper.add_utxo(utxo(2, 10));
        let expiry = Utc::now() + Duration::minutes(1);
        let a = keeper.reserve_particular(&Hash::from_u64(1), expiry).unwrap();
        let b = keeper.reserve_particular(&Hash::from_u64(2), expiry).unwrap();

        let mut builder = TemplateBuilder::new(2, None);
        builder.on_rollback([a.id, b.id]);
        builder.rollback(&keeper);
        assert_eq!(keeper.reservation_count(), 0);
    }
}

use serde::{Deserialize, Serialize};

use super::{AssetId, Hash, OutputId, TxId, Utxo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub output_id: OutputId,
    pub source_id: TxId,
    pub source_pos: u64,
    pub asset_id: AssetId,
    pub amount: u64,
    #[serde(with = "super::hex_bytes")]
    pub control_program: Vec<u8>,
}

impl From<&Utxo> for TxInput {
    fn from(utxo: &Utxo) -> Self {
        Self {
            output_id: utxo.output_id,
            source_id: utxo.source_id,
            source_pos: utxo.source_pos,
            asset_id: utxo.asset_id,
            amount: utxo.amount,
            control_program: utxo.control_program.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub asset_id: AssetId,
    pub amount: u64,
    #[serde(with = "super::hex_bytes")]
    pub control_program: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Identifier over the canonical encoding of inputs and outputs.
    pub fn id(&self) -> TxId {
        let mut buf = Vec::with_capacity(16 + self.inputs.len() * 32 + self.outputs.len() * 64);
        buf.extend_from_slice(&(self.inputs.len() as u64).to_be_bytes());
        for input in &self.inputs {
            buf.extend_from_slice(input.output_id.as_bytes());
        }
        buf.extend_from_slice(&(self.outputs.len() as u64).to_be_bytes());
        for output in &self.outputs {
            buf.extend_from_slice(output.asset_id.as_bytes());
            buf.extend_from_slice(&output.amount.to_be_bytes());
            buf.extend_from_slice(&(output.control_program.len() as u64).to_be_bytes());
            buf.extend_from_slice(&output.control_program);
        }
        Hash::digest(&[&buf])
    }
}

/// An unsigned transaction ready to be handed to the signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxTemplate {
    pub tx_id: TxId,
    pub transaction: Transaction,
    /// Output ids in output order
    pub result_ids: Vec<OutputId>,
}

impl TxTemplate {
    pub fn new(transaction: Transaction) -> Self {
        let tx_id = transaction.id();
        let result_ids = (0..transaction.outputs.len() as u64)
            .map(|pos| Hash::digest(&[tx_id.as_bytes(), &pos.to_be_bytes()]))
            .collect();
        Self {
            tx_id,
            transaction,
            result_ids,
        }
    }

    pub fn input_amounts(&self) -> Vec<u64> {
        self.transaction.inputs.iter().map(|i| i.amount).collect()
    }

    pub fn input_count(&self) -> usize {
        self.transaction.inputs.len()
    }

    /// Turns output `pos` into a UTXO owned by `owner`, spendable before this template confirms.
    pub fn output_as_utxo(&self, pos: usize, owner: &Utxo) -> Option<Utxo> {
        let output = self.transaction.outputs.get(pos)?;
        Some(Utxo {
            output_id: *self.result_ids.get(pos)?,
            source_id: self.tx_id,
            source_pos: pos as u64,
            asset_id: output.asset_id,
            amount: output.amount,
            account_id: owner.account_id.clone(),
            control_program: output.control_program.clone(),
            address: owner.address.clone(),
            control_program_index: owner.control_program_index,
            change: true,
        })
    }
}

//! Data models shared by the keeper, the chain builder and the UTXO store.
//!
//! # Key Types
//!
//! - [`Hash`] - 32-byte identifier used for outputs, assets and transactions
//! - [`Utxo`] - A spendable output owned by an account
//! - [`UtxoKey`] - The (account, asset) pair UTXOs are grouped and reserved under
//! - [`Transaction`] / [`TxTemplate`] - Unsigned transactions produced by a build attempt

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod transaction;
pub use transaction::{Transaction, TxInput, TxOutput, TxTemplate};

/// Opaque account identifier, owned by the account subsystem.
pub type AccountId = String;

pub type OutputId = Hash;
pub type AssetId = Hash;
pub type TxId = Hash;

/// The native asset. Chain merge fees are always paid in it.
pub const NATIVE_ASSET_ID: AssetId = Hash([0xff; 32]);

#[derive(Debug, Error)]
pub enum HashParseError {
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Expected 32 bytes, got {0}")]
    Length(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Builds a hash whose first eight bytes are `v` in big endian order, the rest zero.
    ///
    /// Byte order keeps `from_u64(a) < from_u64(b)` whenever `a < b`.
    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&v.to_be_bytes());
        Self(bytes)
    }

    /// SHA-256 over the concatenation of `parts`.
    pub fn digest(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HashParseError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A spendable output owned by one account.
///
/// Records are immutable once created: the keeper and the store hand out copies,
/// and only the reservation status of an output ever changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub output_id: OutputId,
    pub source_id: TxId,
    pub source_pos: u64,
    pub asset_id: AssetId,
    pub amount: u64,
    pub account_id: AccountId,
    #[serde(with = "hex_bytes")]
    pub control_program: Vec<u8>,
    pub address: String,
    pub control_program_index: u64,
    /// `true` for change generated by the wallet itself, `false` for received funds
    pub change: bool,
}

impl Utxo {
    pub fn key(&self) -> UtxoKey {
        UtxoKey::new(self.account_id.clone(), self.asset_id)
    }
}

/// The (account, asset) pair UTXOs are grouped, reserved and chained under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UtxoKey {
    pub account_id: AccountId,
    pub asset_id: AssetId,
}

impl UtxoKey {
    pub fn new(account_id: impl Into<AccountId>, asset_id: AssetId) -> Self {
        Self {
            account_id: account_id.into(),
            asset_id,
        }
    }
}

impl fmt::Display for UtxoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.asset_id)
    }
}

/// Key of the chain templates returned for one merged spend.
pub type TemplateKey = UtxoKey;

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

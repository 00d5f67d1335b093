//! Transaction records carried in a block body.
//!
//! Every record kind commits the same five fields to the Merkle tree
//! (`id`, `sender`, `recipient`, `amount`, `timestamp`); see
//! [`TxRecord::leaf_preimage`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    COINBASE_SENDER, GENESIS_DATA, GENESIS_TIMESTAMP, GENESIS_TX_ID, MAX_TRANSACTION_VALUE, SYSTEM_SENDER,
};
use crate::error::{LedgerError, Result};
use crate::now_secs;
use crate::signature::KeyPair;

fn new_tx_id() -> String {
    Uuid::new_v4().to_string()
}

/// A value transfer submitted by a client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    #[serde(default = "new_tx_id")]
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    #[serde(default)]
    pub fee: u64,
    #[serde(default = "now_secs")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
}

impl Transaction {
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>, amount: u64, fee: u64) -> Self {
        Self {
            id: new_tx_id(),
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
            fee,
            timestamp: now_secs(),
            signature: None,
            data: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::validation("transaction id must not be blank"));
        }
        if self.amount == 0 {
            return Err(LedgerError::validation("transaction amount must be positive"));
        }
        if self.amount > MAX_TRANSACTION_VALUE || self.fee > MAX_TRANSACTION_VALUE {
            return Err(LedgerError::validation(format!(
                "amount and fee must not exceed {MAX_TRANSACTION_VALUE}"
            )));
        }
        if self.sender.trim().is_empty() || self.recipient.trim().is_empty() {
            return Err(LedgerError::validation("sender and recipient are required"));
        }
        Ok(())
    }

    /// Bytes covered by the signature.
    pub fn signing_payload(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            self.id, self.sender, self.recipient, self.amount, self.fee, self.timestamp
        )
    }

    pub fn sign(&mut self, key: &KeyPair) {
        self.signature = Some(key.sign(&self.signing_payload()));
    }

    pub fn verify_signature(&self, public_key: &str) -> bool {
        match &self.signature {
            Some(signature) => KeyPair::verify(&self.signing_payload(), signature, public_key),
            None => false,
        }
    }
}

/// Block reward minted by the miner; never pooled.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoinbaseTransaction {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub timestamp: u64,
    pub reward: u64,
    pub fees_collected: u64,
}

impl CoinbaseTransaction {
    /// Fails when `reward + fees` does not fit in a `u64`.
    pub fn new(recipient: impl Into<String>, reward: u64, fees: u64) -> Result<Self> {
        let amount = reward
            .checked_add(fees)
            .ok_or_else(|| LedgerError::validation("coinbase amount overflows"))?;
        Ok(Self {
            id: new_tx_id(),
            sender: COINBASE_SENDER.to_string(),
            recipient: recipient.into(),
            amount,
            timestamp: now_secs(),
            reward,
            fees_collected: fees,
        })
    }
}

/// Sum of `fees`, or a validation error if it overflows.
pub fn total_fees<'a>(transactions: impl IntoIterator<Item = &'a Transaction>) -> Result<u64> {
    transactions
        .into_iter()
        .try_fold(0u64, |total, tx| total.checked_add(tx.fee))
        .ok_or_else(|| LedgerError::validation("transaction fees overflow"))
}

/// Free-text entry, used by the genesis block and `Blockchain::add_block`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataRecord {
    #[serde(default = "new_tx_id")]
    pub id: String,
    pub sender: String,
    pub data: String,
    #[serde(default = "now_secs")]
    pub timestamp: u64,
}

impl DataRecord {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: new_tx_id(),
            sender: SYSTEM_SENDER.to_string(),
            data: data.into(),
            timestamp: now_secs(),
        }
    }

    pub fn genesis() -> Self {
        Self {
            id: GENESIS_TX_ID.to_string(),
            sender: SYSTEM_SENDER.to_string(),
            data: GENESIS_DATA.to_string(),
            timestamp: GENESIS_TIMESTAMP,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxRecord {
    Transfer(Transaction),
    Coinbase(CoinbaseTransaction),
    Data(DataRecord),
}

impl TxRecord {
    pub fn id(&self) -> &str {
        match self {
            TxRecord::Transfer(tx) => &tx.id,
            TxRecord::Coinbase(tx) => &tx.id,
            TxRecord::Data(rec) => &rec.id,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            TxRecord::Transfer(tx) => &tx.sender,
            TxRecord::Coinbase(tx) => &tx.sender,
            TxRecord::Data(rec) => &rec.sender,
        }
    }

    pub fn fee(&self) -> u64 {
        match self {
            TxRecord::Transfer(tx) => tx.fee,
            _ => 0,
        }
    }

    /// Newly minted coins carried by this record.
    pub fn reward(&self) -> u64 {
        match self {
            TxRecord::Coinbase(tx) => tx.reward,
            _ => 0,
        }
    }

    pub fn as_transfer(&self) -> Option<&Transaction> {
        match self {
            TxRecord::Transfer(tx) => Some(tx),
            _ => None,
        }
    }

    /// Deterministic serialization hashed into a Merkle leaf:
    /// `id ‖ sender ‖ recipient ‖ amount ‖ timestamp`.
    /// Data records put their text in the recipient slot and an amount of 0.
    pub fn leaf_preimage(&self) -> String {
        match self {
            TxRecord::Transfer(tx) => {
                format!("{}{}{}{}{}", tx.id, tx.sender, tx.recipient, tx.amount, tx.timestamp)
            }
            TxRecord::Coinbase(tx) => {
                format!("{}{}{}{}{}", tx.id, tx.sender, tx.recipient, tx.amount, tx.timestamp)
            }
            TxRecord::Data(rec) => format!("{}{}{}0{}", rec.id, rec.sender, rec.data, rec.timestamp),
        }
    }
}

impl From<Transaction> for TxRecord {
    fn from(tx: Transaction) -> Self {
        TxRecord::Transfer(tx)
    }
}

impl From<CoinbaseTransaction> for TxRecord {
    fn from(tx: CoinbaseTransaction) -> Self {
        TxRecord::Coinbase(tx)
    }
}

impl From<DataRecord> for TxRecord {
    fn from(rec: DataRecord) -> Self {
        TxRecord::Data(rec)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DisplayFromStr, serde_as};
use solana_sdk::{pubkey::Pubkey, signature::Signature};

/// One `logsNotification` as delivered by a subscription channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogNotification {
    pub signature: String,
    pub slot: u64,
    pub logs: Vec<String>,
    /// Set when the transaction failed, the logs then carry no usable match.
    pub err: Option<String>,
}

impl LogNotification {
    /// First log line containing `marker`.
    pub fn find_log(&self, marker: &str) -> Option<&str> {
        self.logs
            .iter()
            .find(|log| log.contains(marker))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionRecord {
    pub program_id: Pubkey,
    pub accounts: Vec<Pubkey>,
}

/// Fetched transaction reduced to its top level instructions with resolved
/// account keys.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub signature: Signature,
    pub slot: u64,
    pub blk_ts: Option<DateTime<Utc>>,
    pub instructions: Vec<InstructionRecord>,
    /// Body as returned by the ledger, kept only when raw auditing is on.
    pub raw: Option<Value>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEvent {
    #[serde_as(as = "DisplayFromStr")]
    pub signature: Signature,
    pub slot: u64,
    pub blk_ts: Option<DateTime<Utc>>,
    #[serde_as(as = "DisplayFromStr")]
    pub pair: Pubkey,
    #[serde_as(as = "DisplayFromStr")]
    pub token_a: Pubkey,
    #[serde_as(as = "DisplayFromStr")]
    pub token_b: Pubkey,
}

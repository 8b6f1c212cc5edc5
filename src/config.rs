use std::path::PathBuf;

use clap::ValueEnum;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use url::Url;

use crate::raydium::{INITIALIZE2_LOG_MARKER, RAYDIUM_AMM_PROGRAM_ID};

/// Which subscription channel implementation the watcher runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// raw `logsSubscribe` over a websocket
    #[default]
    Websocket,
    /// solana pubsub client
    Pubsub,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub rpc_endpoint: Url,
    pub stream_endpoint: Url,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_program_address")]
    pub program_address: Pubkey,
    #[serde(default = "default_instruction_marker")]
    pub instruction_marker: String,
    #[serde(default = "default_commitment")]
    pub commitment: CommitmentLevel,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_open_failures")]
    pub max_open_failures: u32,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_print_table")]
    pub print_table: bool,
    #[serde(default = "default_explorer_tx_url")]
    pub explorer_tx_url: String,
    pub jsonl_path: Option<PathBuf>,
    /// Every notification that matched the marker, duplicates included.
    pub raw_notifications_path: Option<PathBuf>,
    /// Every `getTransaction` body, `null` when the ledger did not know it.
    pub raw_transactions_path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            print_table: default_print_table(),
            explorer_tx_url: default_explorer_tx_url(),
            jsonl_path: None,
            raw_notifications_path: None,
            raw_transactions_path: None,
        }
    }
}

fn default_program_address() -> Pubkey {
    RAYDIUM_AMM_PROGRAM_ID
}

fn default_instruction_marker() -> String {
    INITIALIZE2_LOG_MARKER.to_string()
}

fn default_commitment() -> CommitmentLevel {
    CommitmentLevel::Finalized
}

fn default_dedup_capacity() -> usize {
    100_000
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_max_open_failures() -> u32 {
    10
}

fn default_print_table() -> bool {
    true
}

fn default_explorer_tx_url() -> String {
    "https://solscan.io/tx/".to_string()
}

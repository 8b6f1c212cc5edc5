pub mod accounts;

use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;

pub const RAYDIUM_AMM_PROGRAM_ID: Pubkey = pubkey!("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");

/// Log line substring emitted by the AMM when a pool is initialized.
pub const INITIALIZE2_LOG_MARKER: &str = "initialize2";

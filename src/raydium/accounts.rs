use crate::{
    common::{InstructionRecord, PoolEvent, TransactionRecord},
    error::PipelineError,
};

/// Positions of the accounts we care about inside an AMM `initialize2`
/// instruction.
///
/// The positions are part of the AMM program ABI. A change of that ABI gets a
/// new layout constant with a bumped `version`, the old one is kept so that
/// historical transactions can still be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Initialize2Layout {
    pub version: u8,
    /// amm pool account
    pub pair: usize,
    /// coin mint
    pub token_a: usize,
    /// pc mint
    pub token_b: usize,
}

pub const INITIALIZE2_LAYOUT_V1: Initialize2Layout = Initialize2Layout {
    version: 1,
    pair: 4,
    token_a: 8,
    token_b: 9,
};

impl Default for Initialize2Layout {
    fn default() -> Self {
        INITIALIZE2_LAYOUT_V1
    }
}

impl Initialize2Layout {
    pub const fn min_accounts(&self) -> usize {
        let mut max = self.pair;
        if self.token_a > max {
            max = self.token_a;
        }
        if self.token_b > max {
            max = self.token_b;
        }
        max + 1
    }

    pub fn extract(
        &self,
        tx: &TransactionRecord,
        ix: &InstructionRecord,
    ) -> Result<PoolEvent, PipelineError> {
        let accounts = &ix.accounts;
        if accounts.len() < self.min_accounts() {
            return Err(PipelineError::MalformedInstruction {
                signature: tx.signature,
                len: accounts.len(),
                min: self.min_accounts(),
                layout_version: self.version,
            });
        }

        let account_at = |idx: usize, role: &str| {
            accounts.get(idx).copied().ok_or_else(|| {
                PipelineError::extraction(tx.signature, format!("need {role} at account #{idx}"))
            })
        };

        Ok(PoolEvent {
            signature: tx.signature,
            slot: tx.slot,
            blk_ts: tx.blk_ts,
            pair: account_at(self.pair, "amm pool")?,
            token_a: account_at(self.token_a, "coin mint")?,
            token_b: account_at(self.token_b, "pc mint")?,
        })
    }
}

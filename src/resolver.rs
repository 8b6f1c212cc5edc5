use std::{str::FromStr, sync::Arc};

use chrono::DateTime;
use serde_json::{Value, json};
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::{config::RpcTransactionConfig, request::RpcRequest};
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    pubkey::Pubkey,
    signature::Signature,
};
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, EncodedTransaction, UiLoadedAddresses, UiMessage,
    UiTransactionEncoding,
};
use tracing::{info, warn};

use crate::{
    common::{InstructionRecord, PoolEvent, TransactionRecord},
    error::PipelineError,
    output::Sink,
    raydium::accounts::Initialize2Layout,
};

/// Where transaction bodies come from. `Ok(None)` means the ledger does not
/// know the signature (yet).
pub trait TransactionSource: Send + Sync + 'static {
    fn fetch_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<Option<TransactionRecord>, PipelineError>> + Send;
}

impl TransactionRecord {
    /// Resolves compiled instruction indexes against the static keys followed by
    /// the lookup table keys (writable first, then readonly).
    pub fn from_encoded_tx(
        signature: Signature,
        tx: EncodedConfirmedTransactionWithStatusMeta,
    ) -> Result<Self, PipelineError> {
        let EncodedConfirmedTransactionWithStatusMeta {
            slot,
            transaction,
            block_time,
        } = tx;

        let EncodedTransaction::Json(ui_tx) = transaction.transaction else {
            return Err(PipelineError::extraction(
                signature,
                "transaction is not json encoded",
            ));
        };
        let UiMessage::Raw(message) = ui_tx.message else {
            return Err(PipelineError::extraction(
                signature,
                "expect raw message, got parsed",
            ));
        };
        let loaded: Option<UiLoadedAddresses> = transaction
            .meta
            .and_then(|meta| meta.loaded_addresses.into());
        let (writable, readonly) = match loaded {
            Some(loaded) => (loaded.writable, loaded.readonly),
            None => (vec![], vec![]),
        };

        let account_keys = message
            .account_keys
            .iter()
            .chain(writable.iter())
            .chain(readonly.iter())
            .map(|key| {
                Pubkey::from_str(key).map_err(|err| {
                    PipelineError::extraction(signature, format!("bad account key {key}: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let key_at = |idx: u8| {
            account_keys.get(idx as usize).copied().ok_or_else(|| {
                PipelineError::extraction(
                    signature,
                    format!(
                        "account index {idx} out of range, transaction has {} keys",
                        account_keys.len()
                    ),
                )
            })
        };

        let mut instructions = Vec::with_capacity(message.instructions.len());
        for ix in &message.instructions {
            let program_id = key_at(ix.program_id_index)?;
            let accounts = ix
                .accounts
                .iter()
                .map(|idx| key_at(*idx))
                .collect::<Result<Vec<_>, _>>()?;
            instructions.push(InstructionRecord {
                program_id,
                accounts,
            });
        }

        Ok(Self {
            signature,
            slot,
            blk_ts: block_time.and_then(|blk_ts| DateTime::from_timestamp(blk_ts, 0)),
            instructions,
            raw: None,
        })
    }
}

/// Fetches transactions with `getTransaction` on a json rpc node.
pub struct RpcTransactionSource {
    rpc_client: Arc<RpcClient>,
    commitment: CommitmentLevel,
    keep_raw: bool,
}

impl RpcTransactionSource {
    pub fn new(rpc_client: Arc<RpcClient>, commitment: CommitmentLevel) -> Self {
        // getTransaction rejects `processed`
        let commitment = match commitment {
            CommitmentLevel::Processed => CommitmentLevel::Confirmed,
            other => other,
        };
        Self {
            rpc_client,
            commitment,
            keep_raw: false,
        }
    }

    /// Keeps the json body on every fetched record.
    pub fn keep_raw(mut self, keep_raw: bool) -> Self {
        self.keep_raw = keep_raw;
        self
    }

    pub fn commitment(&self) -> CommitmentLevel {
        self.commitment
    }

    pub fn tx_config(&self) -> RpcTransactionConfig {
        RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(CommitmentConfig {
                commitment: self.commitment,
            }),
            max_supported_transaction_version: Some(0),
        }
    }
}

impl TransactionSource for RpcTransactionSource {
    async fn fetch_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionRecord>, PipelineError> {
        // `get_transaction_with_config` turns a null result into an error,
        // NotFound needs to stay distinguishable
        let resp: Option<EncodedConfirmedTransactionWithStatusMeta> = self
            .rpc_client
            .send(
                RpcRequest::GetTransaction,
                json!([signature.to_string(), self.tx_config()]),
            )
            .await
            .map_err(|err| PipelineError::FetchFailed {
                signature: *signature,
                reason: err.to_string(),
            })?;

        let Some(tx) = resp else {
            return Ok(None);
        };
        let raw = if self.keep_raw {
            let raw = serde_json::to_value(&tx).map_err(|err| {
                PipelineError::extraction(signature, format!("serialize body error: {err}"))
            })?;
            Some(raw)
        } else {
            None
        };

        let mut record = TransactionRecord::from_encoded_tx(*signature, tx)?;
        record.raw = raw;
        Ok(Some(record))
    }
}

/// Turns a signature into pool events: fetch, pick the monitored program's
/// instructions, extract, emit.
pub struct Resolver<S, K> {
    source: S,
    sink: K,
    program_id: Pubkey,
    layout: Initialize2Layout,
}

impl<S, K> Resolver<S, K>
where
    S: TransactionSource,
    K: Sink,
{
    pub fn new(source: S, sink: K, program_id: Pubkey) -> Self {
        Self {
            source,
            sink,
            program_id,
            layout: Initialize2Layout::default(),
        }
    }

    pub fn with_layout(mut self, layout: Initialize2Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub async fn resolve(&self, signature: Signature) -> Result<TransactionRecord, PipelineError> {
        match self.source.fetch_transaction(&signature).await? {
            Some(tx) => {
                if let Some(raw) = &tx.raw {
                    self.sink.audit_transaction(&signature, raw);
                }
                Ok(tx)
            }
            None => {
                self.sink.audit_transaction(&signature, &Value::Null);
                Err(PipelineError::NotFound { signature })
            }
        }
    }

    pub fn matching_instructions<'a>(
        &self,
        tx: &'a TransactionRecord,
    ) -> Result<Vec<&'a InstructionRecord>, PipelineError> {
        let ixs: Vec<_> = tx
            .instructions
            .iter()
            .filter(|ix| ix.program_id == self.program_id)
            .collect();
        if ixs.is_empty() {
            return Err(PipelineError::NoMatchingInstruction {
                signature: tx.signature,
                program_id: self.program_id,
            });
        }

        Ok(ixs)
    }

    /// Resolves and extracts every pool event of `signature` without emitting.
    /// Instructions that fail extraction are logged and skipped.
    pub async fn pool_events(&self, signature: Signature) -> Result<Vec<PoolEvent>, PipelineError> {
        let tx = self.resolve(signature).await?;
        let ixs = self.matching_instructions(&tx)?;

        let mut evts = Vec::with_capacity(ixs.len());
        for ix in ixs {
            match self.layout.extract(&tx, ix) {
                Ok(evt) => evts.push(evt),
                Err(err) => {
                    warn!(%signature, kind = err.kind(), "drop instruction: {err}");
                }
            }
        }

        Ok(evts)
    }

    /// Runs one signature through the pipeline. Failures are terminal for the
    /// signature and only logged. Returns the number of emitted events.
    pub async fn handle(&self, signature: Signature) -> usize {
        match self.pool_events(signature).await {
            Ok(evts) => {
                let emitted = evts.len();
                for evt in evts {
                    info!(
                        "new pool {} found in tx {}, token a: {}, token b: {}",
                        evt.pair, signature, evt.token_a, evt.token_b
                    );
                    self.sink.emit(evt);
                }
                emitted
            }
            Err(err) => {
                warn!(%signature, kind = err.kind(), "drop signature: {err}");
                0
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::{output::OutputRecord, raydium::RAYDIUM_AMM_PROGRAM_ID};

    /// In memory ledger counting fetches per signature.
    #[derive(Default)]
    pub(crate) struct MemorySource {
        pub txs: HashMap<Signature, TransactionRecord>,
        pub fetches: Mutex<HashMap<Signature, usize>>,
        pub total_fetches: AtomicUsize,
    }

    impl MemorySource {
        pub fn with_txs(txs: impl IntoIterator<Item = TransactionRecord>) -> Self {
            Self {
                txs: txs.into_iter().map(|tx| (tx.signature, tx)).collect(),
                ..Default::default()
            }
        }

        pub fn fetch_count(&self, signature: &Signature) -> usize {
            self.fetches
                .lock()
                .unwrap()
                .get(signature)
                .copied()
                .unwrap_or_default()
        }
    }

    impl TransactionSource for Arc<MemorySource> {
        async fn fetch_transaction(
            &self,
            signature: &Signature,
        ) -> Result<Option<TransactionRecord>, PipelineError> {
            self.total_fetches.fetch_add(1, Ordering::SeqCst);
            *self.fetches.lock().unwrap().entry(*signature).or_default() += 1;
            tokio::task::yield_now().await;
            Ok(self.txs.get(signature).cloned())
        }
    }

    pub(crate) fn pool_tx(signature: Signature, accounts: Vec<Pubkey>) -> TransactionRecord {
        TransactionRecord {
            signature,
            slot: 1000,
            blk_ts: None,
            instructions: vec![
                InstructionRecord {
                    program_id: Pubkey::new_unique(),
                    accounts: vec![Pubkey::new_unique()],
                },
                InstructionRecord {
                    program_id: RAYDIUM_AMM_PROGRAM_ID,
                    accounts,
                },
            ],
            raw: None,
        }
    }

    fn unique_keys(n: usize) -> Vec<Pubkey> {
        (0..n).map(|_| Pubkey::new_unique()).collect()
    }

    fn to_strings(keys: &[Pubkey]) -> Vec<String> {
        keys.iter().map(|it| it.to_string()).collect()
    }

    fn status_meta(writable: &[Pubkey], readonly: &[Pubkey]) -> Value {
        json!({
            "err": null,
            "status": { "Ok": null },
            "fee": 5000,
            "preBalances": [],
            "postBalances": [],
            "innerInstructions": [],
            "logMessages": [],
            "preTokenBalances": [],
            "postTokenBalances": [],
            "rewards": [],
            "loadedAddresses": {
                "writable": to_strings(writable),
                "readonly": to_strings(readonly)
            },
            "computeUnitsConsumed": 1200
        })
    }

    fn raw_message(keys: &[Pubkey], instructions: Value) -> Value {
        json!({
            "accountKeys": to_strings(keys),
            "header": {
                "numRequiredSignatures": 1,
                "numReadonlySignedAccounts": 0,
                "numReadonlyUnsignedAccounts": 1
            },
            "recentBlockhash": "11111111111111111111111111111111",
            "instructions": instructions
        })
    }

    #[test]
    fn test_from_legacy_tx() {
        let keys = unique_keys(4);
        let signature = Signature::new_unique();
        let raw = json!({
            "slot": 312_000_123u64,
            "blockTime": 1_720_000_000i64,
            "meta": status_meta(&[], &[]),
            "transaction": {
                "signatures": [signature.to_string()],
                "message": raw_message(&keys, json!([
                    { "programIdIndex": 3, "accounts": [0, 2, 1], "data": "3Bxs4h24hBtQy9rw", "stackHeight": null }
                ]))
            },
            "version": "legacy"
        });

        let tx: EncodedConfirmedTransactionWithStatusMeta = serde_json::from_value(raw).unwrap();
        let record = TransactionRecord::from_encoded_tx(signature, tx).unwrap();
        assert_eq!(record.slot, 312_000_123);
        assert_eq!(
            record.blk_ts.map(|it| it.timestamp()),
            Some(1_720_000_000)
        );
        assert_eq!(record.instructions.len(), 1);
        assert_eq!(record.instructions[0].program_id, keys[3]);
        assert_eq!(record.instructions[0].accounts, vec![keys[0], keys[2], keys[1]]);
        assert!(record.raw.is_none());
    }

    #[test]
    fn test_from_v0_tx_with_lookup_tables() {
        let static_keys = unique_keys(3);
        let writable = unique_keys(1);
        let readonly = unique_keys(2);
        let signature = Signature::new_unique();
        let mut message = raw_message(
            &static_keys,
            json!([{ "programIdIndex": 2, "accounts": [3, 4, 5, 0], "data": "" }]),
        );
        message["addressTableLookups"] = json!([{
            "accountKey": Pubkey::new_unique().to_string(),
            "writableIndexes": [0],
            "readonlyIndexes": [1, 2]
        }]);
        let raw = json!({
            "slot": 5,
            "blockTime": null,
            "meta": status_meta(&writable, &readonly),
            "transaction": {
                "signatures": [signature.to_string()],
                "message": message
            },
            "version": 0
        });

        let tx: EncodedConfirmedTransactionWithStatusMeta = serde_json::from_value(raw).unwrap();
        let record = TransactionRecord::from_encoded_tx(signature, tx).unwrap();
        assert!(record.blk_ts.is_none());
        let ix = &record.instructions[0];
        assert_eq!(ix.program_id, static_keys[2]);
        assert_eq!(
            ix.accounts,
            vec![writable[0], readonly[0], readonly[1], static_keys[0]]
        );
    }

    #[test]
    fn test_from_tx_index_out_of_range() {
        let keys = unique_keys(2);
        let signature = Signature::new_unique();
        let raw = json!({
            "slot": 5,
            "blockTime": null,
            "meta": null,
            "transaction": {
                "signatures": [signature.to_string()],
                "message": raw_message(&keys, json!([
                    { "programIdIndex": 1, "accounts": [0, 7], "data": "" }
                ]))
            }
        });

        let tx: EncodedConfirmedTransactionWithStatusMeta = serde_json::from_value(raw).unwrap();
        let result = TransactionRecord::from_encoded_tx(signature, tx);
        assert!(matches!(
            result,
            Err(PipelineError::ExtractionFailure { .. })
        ));
    }

    #[test]
    fn test_processed_commitment_is_raised() {
        let rpc_client = Arc::new(RpcClient::new("http://127.0.0.1:8899".to_string()));
        let source = RpcTransactionSource::new(rpc_client.clone(), CommitmentLevel::Processed);
        assert_eq!(source.commitment(), CommitmentLevel::Confirmed);
        assert_eq!(
            serde_json::to_value(source.tx_config()).unwrap(),
            json!({
                "encoding": "json",
                "commitment": "confirmed",
                "maxSupportedTransactionVersion": 0
            })
        );
        let source = RpcTransactionSource::new(rpc_client, CommitmentLevel::Finalized);
        assert_eq!(source.commitment(), CommitmentLevel::Finalized);
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let source = Arc::new(MemorySource::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<PoolEvent>();
        let resolver = Resolver::new(source.clone(), tx, RAYDIUM_AMM_PROGRAM_ID);

        let signature = Signature::new_unique();
        let result = resolver.resolve(signature).await;
        assert!(matches!(result, Err(PipelineError::NotFound { signature: s }) if s == signature));

        assert_eq!(resolver.handle(signature).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_audits_ledger_answers() {
        let found = Signature::new_unique();
        let missing = Signature::new_unique();
        let mut record = pool_tx(found, unique_keys(10));
        record.raw = Some(json!({ "slot": 1000 }));
        let source = Arc::new(MemorySource::with_txs([record]));
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputRecord>();
        let resolver = Resolver::new(source, tx, RAYDIUM_AMM_PROGRAM_ID);

        assert_eq!(resolver.handle(found).await, 1);
        assert_eq!(resolver.handle(missing).await, 0);

        assert_eq!(
            rx.try_recv().unwrap(),
            OutputRecord::Transaction {
                signature: found,
                body: json!({ "slot": 1000 }),
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), OutputRecord::Pool(evt) if evt.signature == found));
        assert_eq!(
            rx.try_recv().unwrap(),
            OutputRecord::Transaction {
                signature: missing,
                body: Value::Null,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_custom_layout() {
        let program_id = Pubkey::new_unique();
        let signature = Signature::new_unique();
        let accounts = unique_keys(6);
        let mut record = pool_tx(signature, vec![]);
        record.instructions = vec![InstructionRecord {
            program_id,
            accounts: accounts.clone(),
        }];
        let source = Arc::new(MemorySource::with_txs([record]));
        let (tx, _rx) = mpsc::unbounded_channel::<PoolEvent>();
        let resolver = Resolver::new(source, tx, program_id).with_layout(Initialize2Layout {
            version: 2,
            pair: 0,
            token_a: 5,
            token_b: 2,
        });
        assert_eq!(resolver.program_id(), program_id);

        let evts = resolver.pool_events(signature).await.unwrap();
        assert_eq!(evts.len(), 1);
        assert_eq!(evts[0].pair, accounts[0]);
        assert_eq!(evts[0].token_a, accounts[5]);
        assert_eq!(evts[0].token_b, accounts[2]);
    }

    #[tokio::test]
    async fn test_no_matching_instruction() {
        let signature = Signature::new_unique();
        let mut record = pool_tx(signature, unique_keys(10));
        record
            .instructions
            .retain(|ix| ix.program_id != RAYDIUM_AMM_PROGRAM_ID);
        let source = Arc::new(MemorySource::with_txs([record]));
        let (tx, mut rx) = mpsc::unbounded_channel::<PoolEvent>();
        let resolver = Resolver::new(source, tx, RAYDIUM_AMM_PROGRAM_ID);

        let result = resolver.pool_events(signature).await;
        assert!(matches!(
            result,
            Err(PipelineError::NoMatchingInstruction { .. })
        ));
        assert_eq!(resolver.handle(signature).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_matching_instructions() {
        let signature = Signature::new_unique();
        let first = unique_keys(10);
        let second = unique_keys(12);
        let mut record = pool_tx(signature, first.clone());
        // a malformed one in between is skipped
        record.instructions.push(InstructionRecord {
            program_id: RAYDIUM_AMM_PROGRAM_ID,
            accounts: unique_keys(3),
        });
        record.instructions.push(InstructionRecord {
            program_id: RAYDIUM_AMM_PROGRAM_ID,
            accounts: second.clone(),
        });
        let source = Arc::new(MemorySource::with_txs([record]));
        let (tx, mut rx) = mpsc::unbounded_channel::<PoolEvent>();
        let resolver = Resolver::new(source, tx, RAYDIUM_AMM_PROGRAM_ID);

        assert_eq!(resolver.handle(signature).await, 2);
        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.pair, first[4]);
        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.pair, second[4]);
        assert_eq!(evt.token_a, second[8]);
        assert_eq!(evt.token_b, second[9]);
        assert!(rx.try_recv().is_err());
    }
}

use std::path::Path;

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::{Value, json};
use solana_sdk::signature::Signature;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    common::{LogNotification, PoolEvent},
    config::OutputConfig,
};

/// Receiver of detected pool events.
///
/// The audit hooks see the raw inputs of the pipeline, they do nothing unless
/// a sink cares about them.
pub trait Sink: Send + Sync + 'static {
    fn emit(&self, evt: PoolEvent);

    /// A notification whose logs matched the marker, duplicates included.
    fn audit_notification(&self, _notification: &LogNotification) {}

    /// The ledger's answer for `signature`, `Value::Null` when it was unknown.
    fn audit_transaction(&self, _signature: &Signature, _body: &Value) {}
}

impl Sink for mpsc::UnboundedSender<PoolEvent> {
    fn emit(&self, evt: PoolEvent) {
        if let Err(err) = self.send(evt) {
            warn!(
                "pool event receiver closed, drop event of tx {}",
                err.0.signature
            );
        }
    }
}

/// Everything the writer task persists.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    Pool(PoolEvent),
    Notification(LogNotification),
    Transaction { signature: Signature, body: Value },
}

impl Sink for mpsc::UnboundedSender<OutputRecord> {
    fn emit(&self, evt: PoolEvent) {
        if let Err(err) = self.send(OutputRecord::Pool(evt)) {
            warn!("output receiver closed, drop {:?}", err.0);
        }
    }

    fn audit_notification(&self, notification: &LogNotification) {
        if self
            .send(OutputRecord::Notification(notification.clone()))
            .is_err()
        {
            warn!(
                "output receiver closed, drop notification of tx {}",
                notification.signature
            );
        }
    }

    fn audit_transaction(&self, signature: &Signature, body: &Value) {
        let record = OutputRecord::Transaction {
            signature: *signature,
            body: body.clone(),
        };
        if self.send(record).is_err() {
            warn!("output receiver closed, drop body of tx {signature}");
        }
    }
}

/// Logs, prints and persists what comes out of the pipeline.
pub struct PoolEventWriter {
    print_table: bool,
    explorer_tx_url: String,
    jsonl: Option<File>,
    raw_notifications: Option<File>,
    raw_transactions: Option<File>,
}

impl PoolEventWriter {
    pub async fn open(config: &OutputConfig) -> Result<Self> {
        Ok(Self {
            print_table: config.print_table,
            explorer_tx_url: config.explorer_tx_url.clone(),
            jsonl: open_optional(config.jsonl_path.as_deref()).await?,
            raw_notifications: open_optional(config.raw_notifications_path.as_deref()).await?,
            raw_transactions: open_optional(config.raw_transactions_path.as_deref()).await?,
        })
    }

    pub async fn write(&mut self, evt: &PoolEvent) -> Result<()> {
        info!(
            "pool created, pair: {}, token a: {}, token b: {}, slot: {}",
            evt.pair, evt.token_a, evt.token_b, evt.slot
        );

        if self.print_table {
            println!("{}", render_table(evt));
            println!("{}", explorer_tx_link(&self.explorer_tx_url, evt));
        }

        if let Some(file) = self.jsonl.as_mut() {
            append_jsonl(file, evt).await?;
        }

        Ok(())
    }

    pub async fn write_record(&mut self, record: &OutputRecord) -> Result<()> {
        match record {
            OutputRecord::Pool(evt) => self.write(evt).await,
            OutputRecord::Notification(notification) => match self.raw_notifications.as_mut() {
                Some(file) => append_jsonl(file, notification).await,
                None => Ok(()),
            },
            OutputRecord::Transaction { signature, body } => {
                match self.raw_transactions.as_mut() {
                    Some(file) => {
                        let line = json!({
                            "signature": signature.to_string(),
                            "transaction": body,
                        });
                        append_jsonl(file, &line).await
                    }
                    None => Ok(()),
                }
            }
        }
    }

    /// Drains `rx` until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<OutputRecord>) {
        while let Some(record) = rx.recv().await {
            if let Err(err) = self.write_record(&record).await {
                warn!("write output record error: {err}, record: {record:?}");
            }
        }
        info!("pool event writer stopped");
    }
}

async fn open_optional(path: Option<&Path>) -> Result<Option<File>> {
    match path {
        Some(path) => Ok(Some(open_append(path).await?)),
        None => Ok(None),
    }
}

async fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| anyhow!("open {} error: {err}", path.display()))
}

async fn append_jsonl(file: &mut File, value: &impl Serialize) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .await
        .map_err(|err| anyhow!("append jsonl line error: {err}"))?;
    file.flush().await?;
    Ok(())
}

pub fn explorer_tx_link(base: &str, evt: &PoolEvent) -> String {
    format!("{}{}", base, evt.signature)
}

pub fn render_table(evt: &PoolEvent) -> String {
    let rows = [
        ("Token A", evt.token_a.to_string()),
        ("Token B", evt.token_b.to_string()),
        ("LP Pair", evt.pair.to_string()),
    ];
    let width = rows.iter().map(|(_, key)| key.len()).max().unwrap_or(0);

    let mut table = String::from("============ NEW POOL DETECTED ============\n");
    table.push_str(&format!("│ {:<12} │ {:<width$} │\n", "Token_Index", "Account Public Key"));
    for (name, key) in rows {
        table.push_str(&format!("│ {name:<12} │ {key:<width$} │\n"));
    }
    table.pop();
    table
}

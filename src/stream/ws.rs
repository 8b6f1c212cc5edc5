use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{ChannelEvent, Subscription, SubscriptionChannel};
use crate::{common::LogNotification, error::PipelineError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const LOGS_SUBSCRIBE_REQUEST_ID: u64 = 1;
const LOGS_NOTIFICATION_METHOD: &str = "logsNotification";

#[derive(Debug, Deserialize)]
struct RpcFrame {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcErrorObject>,
    method: Option<String>,
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogsNotificationParams {
    result: LogsNotificationResult,
    subscription: u64,
}

#[derive(Debug, Deserialize)]
struct LogsNotificationResult {
    context: SlotContext,
    value: LogsValue,
}

#[derive(Debug, Deserialize)]
struct SlotContext {
    slot: u64,
}

#[derive(Debug, Deserialize)]
struct LogsValue {
    signature: String,
    #[serde(default)]
    logs: Vec<String>,
    err: Option<Value>,
}

/// Inbound json rpc frame of a `logsSubscribe` session.
#[derive(Debug, PartialEq, Eq)]
pub enum WsFrame {
    SubscribeAck { id: u64, subscription: u64 },
    Rejected { id: Option<u64>, message: String },
    Logs { subscription: u64, notification: LogNotification },
    Other,
}

pub fn logs_subscribe_request(id: u64, program_id: &Pubkey, commitment: CommitmentLevel) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "logsSubscribe",
        "params": [
            { "mentions": [program_id.to_string()] },
            { "commitment": commitment }
        ]
    })
}

pub fn parse_frame(text: &str) -> Result<WsFrame, PipelineError> {
    let frame: RpcFrame = serde_json::from_str(text)
        .map_err(|err| PipelineError::transport(format!("malformed frame: {err}")))?;

    if let Some(RpcErrorObject { code, message }) = frame.error {
        return Ok(WsFrame::Rejected {
            id: frame.id,
            message: format!("{message} (code {code})"),
        });
    }

    if frame.method.as_deref() == Some(LOGS_NOTIFICATION_METHOD) {
        let params = frame
            .params
            .ok_or_else(|| PipelineError::transport("logsNotification without params"))?;
        let LogsNotificationParams {
            result: LogsNotificationResult { context, value },
            subscription,
        } = serde_json::from_value(params).map_err(|err| {
            PipelineError::transport(format!("malformed logsNotification: {err}"))
        })?;

        return Ok(WsFrame::Logs {
            subscription,
            notification: LogNotification {
                signature: value.signature,
                slot: context.slot,
                logs: value.logs,
                err: value.err.map(|err| err.to_string()),
            },
        });
    }

    if let (Some(id), Some(subscription)) = (frame.id, frame.result.as_ref().and_then(Value::as_u64)) {
        return Ok(WsFrame::SubscribeAck { id, subscription });
    }

    Ok(WsFrame::Other)
}

/// `logsSubscribe` spoken directly over a websocket.
pub struct WsLogsChannel {
    endpoint: Url,
}

impl WsLogsChannel {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

impl SubscriptionChannel for WsLogsChannel {
    async fn open(
        &self,
        program_id: Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<Subscription, PipelineError> {
        info!("connecting to websocket: {}", self.endpoint);
        let (mut ws, _) = connect_async(self.endpoint.as_str()).await.map_err(|err| {
            PipelineError::transport(format!("connect {} error: {err}", self.endpoint))
        })?;

        let req = logs_subscribe_request(LOGS_SUBSCRIBE_REQUEST_ID, &program_id, commitment);
        ws.send(Message::Text(req.to_string()))
            .await
            .map_err(|err| PipelineError::transport(format!("send logsSubscribe error: {err}")))?;

        let subscription = wait_for_ack(&mut ws).await?;
        info!("logs of {program_id} subscribed, subscription id: {subscription}");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_notifications(ws, subscription, tx));

        Ok(Subscription {
            id: Some(subscription),
            events: rx,
        })
    }
}

async fn wait_for_ack(ws: &mut WsStream) -> Result<u64, PipelineError> {
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|err| PipelineError::transport(format!("websocket error: {err}")))?;
        match msg {
            Message::Text(text) => match parse_frame(&text) {
                Ok(WsFrame::SubscribeAck { id, subscription })
                    if id == LOGS_SUBSCRIBE_REQUEST_ID =>
                {
                    return Ok(subscription);
                }
                Ok(WsFrame::Rejected { message, .. }) => {
                    return Err(PipelineError::transport(format!(
                        "logsSubscribe rejected: {message}"
                    )));
                }
                Ok(frame) => debug!("ignore frame before subscribe ack: {frame:?}"),
                Err(err) => warn!("ignore frame before subscribe ack: {err}"),
            },
            Message::Close(frame) => {
                return Err(PipelineError::transport(format!(
                    "websocket closed before subscribe ack: {frame:?}"
                )));
            }
            _ => {}
        }
    }

    Err(PipelineError::transport(
        "websocket ended before subscribe ack",
    ))
}

async fn forward_notifications(
    mut ws: WsStream,
    subscription: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
) {
    let err = loop {
        let Some(msg) = ws.next().await else {
            break PipelineError::transport("websocket stream ended");
        };
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                break PipelineError::transport(format!("websocket closed by server: {frame:?}"));
            }
            Ok(_) => continue,
            Err(err) => break PipelineError::transport(format!("websocket error: {err}")),
        };

        match parse_frame(&text) {
            Ok(WsFrame::Logs {
                subscription: sub_id,
                notification,
            }) if sub_id == subscription => {
                if tx.send(ChannelEvent::Notification(notification)).is_err() {
                    debug!("subscription {subscription} dropped by consumer");
                    let _ = ws.close(None).await;
                    return;
                }
            }
            Ok(frame) => debug!("ignore frame: {frame:?}"),
            Err(err) => warn!("ignore frame: {err}"),
        }
    };

    warn!("subscription {subscription} terminated: {err}");
    let _ = tx.send(ChannelEvent::Error(err));
}

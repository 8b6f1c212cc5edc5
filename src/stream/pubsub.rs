use futures::StreamExt;
use solana_pubsub_client::nonblocking::pubsub_client::PubsubClient;
use solana_rpc_client_api::{
    config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter},
    response::{Response, RpcLogsResponse},
};
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    pubkey::Pubkey,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use super::{ChannelEvent, Subscription, SubscriptionChannel};
use crate::{common::LogNotification, error::PipelineError};

impl From<Response<RpcLogsResponse>> for LogNotification {
    fn from(resp: Response<RpcLogsResponse>) -> Self {
        let Response { context, value } = resp;
        LogNotification {
            signature: value.signature,
            slot: context.slot,
            logs: value.logs,
            err: value.err.map(|err| err.to_string()),
        }
    }
}

/// Log subscription through the managed [`PubsubClient`].
///
/// The client keeps the subscription id to itself, so the returned
/// [`Subscription`] carries no id.
pub struct PubsubLogsChannel {
    endpoint: Url,
}

impl PubsubLogsChannel {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

impl SubscriptionChannel for PubsubLogsChannel {
    async fn open(
        &self,
        program_id: Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<Subscription, PipelineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let endpoint = self.endpoint.to_string();
        info!("connecting to pubsub url: {endpoint}");

        // the log stream borrows the client, both live in the forwarding task
        tokio::spawn(async move {
            let pubsub_client = match PubsubClient::new(&endpoint).await {
                Ok(client) => client,
                Err(err) => {
                    let _ = ack_tx.send(Err(PipelineError::transport(format!(
                        "connect {endpoint} error: {err}"
                    ))));
                    return;
                }
            };

            let subscribed = pubsub_client
                .logs_subscribe(
                    RpcTransactionLogsFilter::Mentions(vec![program_id.to_string()]),
                    RpcTransactionLogsConfig {
                        commitment: Some(CommitmentConfig { commitment }),
                    },
                )
                .await;
            let (mut stream, unsubscribe) = match subscribed {
                Ok(subscribed) => subscribed,
                Err(err) => {
                    let _ = ack_tx.send(Err(PipelineError::transport(format!(
                        "logsSubscribe error: {err}"
                    ))));
                    return;
                }
            };
            if ack_tx.send(Ok(())).is_err() {
                return;
            }

            let mut consumer_gone = false;
            while let Some(resp) = stream.next().await {
                if tx
                    .send(ChannelEvent::Notification(LogNotification::from(resp)))
                    .is_err()
                {
                    debug!("logs subscription of {program_id} dropped by consumer");
                    consumer_gone = true;
                    break;
                }
            }

            drop(stream);
            unsubscribe().await;
            if !consumer_gone {
                warn!("pubsub logs stream of {program_id} ended");
                let _ = tx.send(ChannelEvent::Error(PipelineError::transport(
                    "pubsub logs stream ended",
                )));
            }
        });

        match ack_rx.await {
            Ok(Ok(())) => {
                info!("logs of {program_id} subscribed via pubsub client");
                Ok(Subscription {
                    id: None,
                    events: rx,
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PipelineError::transport(
                "pubsub task stopped before subscribing",
            )),
        }
    }
}

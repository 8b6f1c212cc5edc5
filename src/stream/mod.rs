mod pubsub;
mod ws;

pub use pubsub::*;
pub use ws::*;

use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use tokio::sync::mpsc;

use crate::{common::LogNotification, error::PipelineError};

#[derive(Debug)]
pub enum ChannelEvent {
    Notification(LogNotification),
    /// The transport failed, no more events follow.
    Error(PipelineError),
}

/// An acknowledged `logsSubscribe`. Events arrive in delivery order; the
/// receiver yields `None` once the transport task is gone.
#[derive(Debug)]
pub struct Subscription {
    /// Server side subscription id, when the transport exposes it.
    pub id: Option<u64>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// A transport able to stream the logs mentioning a program.
///
/// Implementations never reconnect on their own, a failed transport shows up
/// as [`ChannelEvent::Error`] and reopening is up to the caller.
pub trait SubscriptionChannel: Send + Sync {
    fn open(
        &self,
        program_id: Pubkey,
        commitment: CommitmentLevel,
    ) -> impl Future<Output = Result<Subscription, PipelineError>> + Send;
}

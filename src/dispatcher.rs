use std::{num::NonZeroUsize, str::FromStr, sync::Arc};

use lru::LruCache;
use solana_sdk::signature::Signature;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    common::LogNotification,
    error::PipelineError,
    output::Sink,
    resolver::{Resolver, TransactionSource},
    stream::{ChannelEvent, Subscription},
};

const DEFAULT_DEDUP_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100_000) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

/// Signatures already handed to the resolver, bounded by least recently seen
/// eviction.
pub struct SeenSignatures {
    cache: LruCache<Signature, ()>,
}

impl SeenSignatures {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(DEFAULT_DEDUP_CAPACITY);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Returns `true` when `signature` was not seen before.
    pub fn insert(&mut self, signature: Signature) -> bool {
        if self.cache.get(&signature).is_some() {
            return false;
        }
        self.cache.put(signature, ());
        true
    }

    pub fn contains(&self, signature: &Signature) -> bool {
        self.cache.contains(signature)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Filters log notifications and starts at most one resolution per signature.
pub struct Dispatcher<S, K> {
    resolver: Arc<Resolver<S, K>>,
    marker: String,
    seen: SeenSignatures,
    in_flight: JoinSet<usize>,
}

impl<S, K> Dispatcher<S, K>
where
    S: TransactionSource,
    K: Sink,
{
    pub fn new(resolver: Resolver<S, K>, marker: impl Into<String>, dedup_capacity: usize) -> Self {
        Self {
            resolver: Arc::new(resolver),
            marker: marker.into(),
            seen: SeenSignatures::new(dedup_capacity),
            in_flight: JoinSet::new(),
        }
    }

    pub fn seen(&self) -> &SeenSignatures {
        &self.seen
    }

    /// Handles one notification. Returns `true` when a resolution was spawned.
    ///
    /// Must be called inside a tokio runtime.
    pub fn on_notification(&mut self, notification: LogNotification) -> bool {
        self.reap_finished();

        if let Some(err) = &notification.err {
            debug!("skip failed tx {}: {err}", notification.signature);
            return false;
        }

        let Some(log) = notification.find_log(&self.marker) else {
            return false;
        };
        self.resolver.sink().audit_notification(&notification);

        let signature = match Signature::from_str(&notification.signature) {
            Ok(signature) => signature,
            Err(err) => {
                let err = PipelineError::extraction(
                    &notification.signature,
                    format!("invalid signature: {err}"),
                );
                warn!(signature = %notification.signature, kind = err.kind(), "drop signature: {err}");
                return false;
            }
        };

        if !self.seen.insert(signature) {
            debug!("duplicate notification for tx {signature}");
            return false;
        }
        info!(
            "found instruction in tx {signature} at slot {}: {log}",
            notification.slot
        );

        let resolver = Arc::clone(&self.resolver);
        self.in_flight
            .spawn(async move { resolver.handle(signature).await });
        true
    }

    /// Feeds the subscription into the dispatcher until the channel reports a
    /// transport failure or closes.
    pub async fn run(&mut self, mut subscription: Subscription) -> PipelineError {
        while let Some(evt) = subscription.events.recv().await {
            match evt {
                ChannelEvent::Notification(notification) => {
                    self.on_notification(notification);
                }
                ChannelEvent::Error(err) => return err,
            }
        }

        PipelineError::transport("subscription channel closed")
    }

    /// Waits for every in flight resolution. Returns the number of events
    /// they emitted.
    pub async fn drain(&mut self) -> usize {
        let mut emitted = 0;
        while let Some(result) = self.in_flight.join_next().await {
            emitted += Self::joined(result);
        }
        emitted
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            Self::joined(result);
        }
    }

    fn joined(result: Result<usize, tokio::task::JoinError>) -> usize {
        result.unwrap_or_else(|err| {
            warn!("resolver task failed: {err}");
            0
        })
    }
}

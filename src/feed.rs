//! Change-event feeds: the push side of the backend.
//!
//! Events are decoded into [`ChangeEvent`] at the boundary and fanned out by
//! [`FeedScope`]: a thread scope carries one thread's activity, a user scope
//! carries activity across every thread the user takes part in.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::gateway::GatewayResult;
use crate::models::{Id, Message, Participant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChangeEvent {
    MessageInserted { message: Message },
    MessageUpdated { message: Message },
    ParticipantUpdated { participant: Participant },
}

impl ChangeEvent {
    pub fn thread_id(&self) -> Id {
        match self {
            ChangeEvent::MessageInserted { message } | ChangeEvent::MessageUpdated { message } => message.thread_id,
            ChangeEvent::ParticipantUpdated { participant } => participant.thread_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::MessageInserted { .. } => "message-inserted",
            ChangeEvent::MessageUpdated { .. } => "message-updated",
            ChangeEvent::ParticipantUpdated { .. } => "participant-updated",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    #[error("unsupported change '{event_type}' on table '{table}'")]
    Unsupported { table: String, event_type: String },
    #[error("malformed change payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Row-level change as emitted by the backing store's replication stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChange {
    pub table: String,
    #[serde(rename = "eventType", alias = "type")]
    pub event_type: String,
    #[serde(rename = "new", default)]
    pub record: serde_json::Value,
}

impl TryFrom<RawChange> for ChangeEvent {
    type Error = FeedError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        let RawChange { table, event_type, record } = raw;
        let op = event_type.to_ascii_uppercase();
        match (table.as_str(), op.as_str()) {
            ("messages", "INSERT") => Ok(ChangeEvent::MessageInserted { message: serde_json::from_value(record)? }),
            ("messages", "UPDATE") => Ok(ChangeEvent::MessageUpdated { message: serde_json::from_value(record)? }),
            ("thread_participants", "INSERT" | "UPDATE") => {
                Ok(ChangeEvent::ParticipantUpdated { participant: serde_json::from_value(record)? })
            }
            _ => Err(FeedError::Unsupported { table, event_type }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedScope {
    Thread(Id),
    User(Id),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(ChangeEvent),
    /// The subscriber fell behind and `missed` events were dropped.
    Gap { missed: u64 },
}

/// A live subscription to one scope. Dropping it unsubscribes.
pub struct FeedSubscription {
    scope: FeedScope,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl FeedSubscription {
    pub fn new(scope: FeedScope, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { scope, rx }
    }

    pub fn scope(&self) -> FeedScope {
        self.scope
    }

    /// Next item, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<FeedItem> {
        match self.rx.recv().await {
            Ok(event) => Some(FeedItem::Event(event)),
            Err(RecvError::Lagged(missed)) => {
                warn!(scope = ?self.scope, missed, "change feed lagged");
                Some(FeedItem::Gap { missed })
            }
            Err(RecvError::Closed) => None,
        }
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scope: FeedScope) -> GatewayResult<FeedSubscription>;
}

/// In-process fan-out of change events, one broadcast channel per scope.
#[derive(Clone)]
pub struct FeedHub {
    channels: Arc<DashMap<FeedScope, broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        Self { channels: Arc::new(DashMap::new()), capacity: capacity.max(1) }
    }

    /// Deliver `event` on its thread scope and on the user scope of every
    /// listed participant. Returns how many receivers got it.
    pub fn publish(&self, event: &ChangeEvent, participants: &[Id]) -> usize {
        let mut delivered = 0;
        let scopes = std::iter::once(FeedScope::Thread(event.thread_id()))
            .chain(participants.iter().map(|u| FeedScope::User(*u)));
        for scope in scopes {
            if let Some(tx) = self.channels.get(&scope) {
                delivered += tx.send(event.clone()).unwrap_or(0);
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, scope: FeedScope) -> usize {
        self.channels.get(&scope).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    fn open(&self, scope: FeedScope) -> broadcast::Receiver<ChangeEvent> {
        // drop channels nobody listens to any more
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        self.channels
            .entry(scope)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChangeFeed for FeedHub {
    async fn subscribe(&self, scope: FeedScope) -> GatewayResult<FeedSubscription> {
        Ok(FeedSubscription::new(scope, self.open(scope)))
    }
}

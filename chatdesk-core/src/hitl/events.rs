//! HITL lifecycle events and the in-process bus that fans them out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlEventKind {
    TypeCreated,
    TypeUpdated,
    TypeDeleted,
    UserAssigned,
    UserRemoved,
}

impl HitlEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypeCreated => "hitl_type.created",
            Self::TypeUpdated => "hitl_type.updated",
            Self::TypeDeleted => "hitl_type.deleted",
            Self::UserAssigned => "hitl_type.user_assigned",
            Self::UserRemoved => "hitl_type.user_removed",
        }
    }

    pub fn is_assignment(&self) -> bool {
        matches!(self, Self::UserAssigned | Self::UserRemoved)
    }
}

/// Immutable event emitted after a HITL mutation has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HitlEvent {
    TypeCreated {
        organization_id: i64,
        hitl_type_id: i64,
        name: String,
        timestamp: DateTime<Utc>,
    },
    TypeUpdated {
        organization_id: i64,
        hitl_type_id: i64,
        name: String,
        timestamp: DateTime<Utc>,
    },
    TypeDeleted {
        organization_id: i64,
        hitl_type_id: i64,
        name: String,
        timestamp: DateTime<Utc>,
    },
    UserAssigned {
        organization_id: i64,
        hitl_type_id: i64,
        name: String,
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
    UserRemoved {
        organization_id: i64,
        hitl_type_id: i64,
        name: String,
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
}

impl HitlEvent {
    pub fn kind(&self) -> HitlEventKind {
        match self {
            Self::TypeCreated { .. } => HitlEventKind::TypeCreated,
            Self::TypeUpdated { .. } => HitlEventKind::TypeUpdated,
            Self::TypeDeleted { .. } => HitlEventKind::TypeDeleted,
            Self::UserAssigned { .. } => HitlEventKind::UserAssigned,
            Self::UserRemoved { .. } => HitlEventKind::UserRemoved,
        }
    }

    pub fn organization_id(&self) -> i64 {
        match self {
            Self::TypeCreated { organization_id, .. }
            | Self::TypeUpdated { organization_id, .. }
            | Self::TypeDeleted { organization_id, .. }
            | Self::UserAssigned { organization_id, .. }
            | Self::UserRemoved { organization_id, .. } => *organization_id,
        }
    }

    pub fn hitl_type_id(&self) -> i64 {
        match self {
            Self::TypeCreated { hitl_type_id, .. }
            | Self::TypeUpdated { hitl_type_id, .. }
            | Self::TypeDeleted { hitl_type_id, .. }
            | Self::UserAssigned { hitl_type_id, .. }
            | Self::UserRemoved { hitl_type_id, .. } => *hitl_type_id,
        }
    }

    pub fn hitl_type_name(&self) -> &str {
        match self {
            Self::TypeCreated { name, .. }
            | Self::TypeUpdated { name, .. }
            | Self::TypeDeleted { name, .. }
            | Self::UserAssigned { name, .. }
            | Self::UserRemoved { name, .. } => name,
        }
    }

    /// Affected user for assignment events.
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Self::UserAssigned { user_id, .. } | Self::UserRemoved { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::TypeCreated { timestamp, .. }
            | Self::TypeUpdated { timestamp, .. }
            | Self::TypeDeleted { timestamp, .. }
            | Self::UserAssigned { timestamp, .. }
            | Self::UserRemoved { timestamp, .. } => *timestamp,
        }
    }
}

/// Fire-and-forget sink for HITL events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: HitlEvent);
}

/// Broadcast-backed event bus. Each subscriber sees every event published
/// after it subscribed; nothing is persisted or retried.
pub struct EventBus {
    sender: broadcast::Sender<HitlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self, subscriber: impl Into<String>) -> EventReceiver {
        EventReceiver {
            subscriber: subscriber.into(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: HitlEvent) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = kind.as_str(), receivers = receivers, "Published HITL event"),
            Err(_) => debug!(event = kind.as_str(), "No subscribers for HITL event"),
        }
    }
}

pub struct EventReceiver {
    subscriber: String,
    receiver: broadcast::Receiver<HitlEvent>,
}

impl EventReceiver {
    /// Next event, or `None` once the bus is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<HitlEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        subscriber = %self.subscriber,
                        skipped = skipped,
                        "HITL event subscriber lagged, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }
}

/// Publisher that keeps every event in memory. Useful for tests and audits.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<HitlEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HitlEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn take(&self) -> Vec<HitlEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: HitlEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

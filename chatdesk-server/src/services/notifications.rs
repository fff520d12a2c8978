//! NotificationService - in-memory feed of recent HITL events
//!
//! Subscribes to the HITL event bus and keeps the most recent events per
//! organization so operators can see what changed. The feed is not persisted;
//! a restart starts empty.

use chatdesk_core::hitl::EventReceiver;
use chatdesk_core::HitlEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// NotificationService keeps a bounded event feed per organization
pub struct NotificationService {
    capacity: usize,
    /// organization_id -> events, oldest first
    feeds: RwLock<HashMap<i64, VecDeque<HitlEvent>>>,
}

impl NotificationService {
    /// Create a new notification service keeping `capacity` events per organization
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            feeds: RwLock::new(HashMap::new()),
        }
    }

    /// Record one event, evicting the oldest when the feed is full
    pub async fn record(&self, event: HitlEvent) {
        info!(
            event = event.kind().as_str(),
            organization_id = event.organization_id(),
            hitl_type_id = event.hitl_type_id(),
            user_id = event.user_id(),
            "HITL notification"
        );

        let mut feeds = self.feeds.write().await;
        let feed = feeds.entry(event.organization_id()).or_default();
        if feed.len() == self.capacity {
            feed.pop_front();
        }
        feed.push_back(event);
    }

    /// Most recent events of an organization, newest first
    pub async fn recent(&self, organization_id: i64, limit: Option<usize>) -> Vec<HitlEvent> {
        let feeds = self.feeds.read().await;
        let Some(feed) = feeds.get(&organization_id) else {
            return Vec::new();
        };
        feed.iter()
            .rev()
            .take(limit.unwrap_or(self.capacity))
            .cloned()
            .collect()
    }

    /// Consume events until the bus closes
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        debug!(subscriber = events.subscriber(), "Notification feed started");
        while let Some(event) = events.recv().await {
            self.record(event).await;
        }
        debug!(subscriber = events.subscriber(), "Notification feed stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn(self: &Arc<Self>, events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(events))
    }
}

//! Application state.

use chatdesk_core::{auth::ServiceToken, Database, EventBus, HitlService, SessionLifecycle};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::services::{EscalationRouter, NotificationService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Service token for front end authentication
    pub service_token: Arc<ServiceToken>,
    /// Chat session lifecycle
    pub sessions: Arc<SessionLifecycle>,
    /// HITL types and assignments
    pub hitl: Arc<HitlService>,
    /// Bus every HITL mutation is published on
    pub events: Arc<EventBus>,
    /// Recent HITL events per organization
    pub notifications: Arc<NotificationService>,
    /// Cached escalation targets
    pub router: Arc<EscalationRouter>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, db: Database, service_token: ServiceToken) -> Arc<Self> {
        let db = Arc::new(db);
        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        let sessions = Arc::new(SessionLifecycle::new(db.clone(), config.session.clone()));
        let hitl = Arc::new(HitlService::new(db.clone(), db.clone(), events.clone()));

        Arc::new(Self {
            notifications: Arc::new(NotificationService::new(config.notification_capacity)),
            router: Arc::new(EscalationRouter::new(Arc::clone(&hitl))),
            config: Arc::new(config),
            db,
            service_token: Arc::new(service_token),
            sessions,
            hitl,
            events,
            start_time: Instant::now(),
        })
    }

    /// Subscribe the notification feed and the escalation cache to the bus
    pub fn spawn_subscribers(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.notifications.spawn(self.events.subscribe("notifications")),
            self.router.spawn(self.events.subscribe("escalation-router")),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_subscribers_registers_receivers() {
        let state = AppState::new(
            Config::default(),
            Database::open_in_memory().unwrap(),
            ServiceToken::generate(),
        );
        assert_eq!(state.events.receiver_count(), 0);

        let handles = state.spawn_subscribers();
        assert_eq!(handles.len(), 2);
        assert_eq!(state.events.receiver_count(), 2);

        for handle in handles {
            handle.abort();
        }
    }
}

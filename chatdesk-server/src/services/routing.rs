//! EscalationRouter - cached resolution of escalation targets
//!
//! Agents escalate a conversation by HITL type name ("soporte", "ventas").
//! Lookups are cached per (organization, name) and every HITL event for an
//! organization drops that organization's entries, so a rename, delete or
//! assignment change is visible on the next lookup.

use chatdesk_core::db::User;
use chatdesk_core::hitl::EventReceiver;
use chatdesk_core::{HitlEvent, HitlService, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

type CacheKey = (i64, String);

/// EscalationRouter resolves HITL type names to assigned users
pub struct EscalationRouter {
    hitl: Arc<HitlService>,
    cache: RwLock<HashMap<CacheKey, Vec<User>>>,
}

impl EscalationRouter {
    pub fn new(hitl: Arc<HitlService>) -> Self {
        Self {
            hitl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Users to escalate to for `name` in the organization
    pub async fn targets(&self, organization_id: i64, name: &str) -> Result<Vec<User>> {
        let key = (organization_id, name.trim().to_string());

        if let Some(users) = self.cache.read().await.get(&key) {
            debug!(organization_id = organization_id, name = %key.1, "Escalation cache hit");
            return Ok(users.clone());
        }

        let users = self.hitl.get_users_by_hitl_type(organization_id, &key.1)?;
        self.cache.write().await.insert(key, users.clone());
        Ok(users)
    }

    /// Drop every cached entry of the event's organization
    pub async fn invalidate(&self, event: &HitlEvent) {
        let organization_id = event.organization_id();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|(org, _), _| *org != organization_id);
        debug!(
            organization_id = organization_id,
            event = event.kind().as_str(),
            evicted = before - cache.len(),
            "Escalation cache invalidated"
        );
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Consume events until the bus closes
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.invalidate(&event).await;
        }
        debug!(subscriber = events.subscriber(), "Escalation router stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn(self: &Arc<Self>, events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdesk_core::db::{NewHitlType, OrganizationRole};
    use chatdesk_core::{Caller, Database, EventBus};

    struct Fixture {
        db: Arc<Database>,
        bus: Arc<EventBus>,
        hitl: Arc<HitlService>,
        owner: Caller,
        org: i64,
    }

    fn setup() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(64));
        let hitl = Arc::new(HitlService::new(db.clone(), db.clone(), bus.clone()));

        let org = db.create_organization("Acme").unwrap().id;
        let owner = db.create_user("Olga", "olga@acme.test").unwrap();
        db.add_membership(owner.id, org, OrganizationRole::Owner).unwrap();

        Fixture {
            db,
            bus,
            hitl,
            owner: Caller::new(owner.id),
            org,
        }
    }

    #[tokio::test]
    async fn test_targets_are_cached_until_invalidated() {
        let f = setup();
        let router = EscalationRouter::new(f.hitl.clone());

        let agent = f.db.create_user("Ana", "ana@acme.test").unwrap();
        f.db.add_membership(agent.id, f.org, OrganizationRole::Hitl).unwrap();
        let soporte = f
            .hitl
            .create(&f.owner, f.org, NewHitlType { name: "soporte".into(), description: None })
            .unwrap();

        assert!(router.targets(f.org, "soporte").await.unwrap().is_empty());
        assert_eq!(router.cached_entries().await, 1);

        f.hitl.assign_users(&f.owner, f.org, soporte.id, &[agent.id]).unwrap();

        // Stale until the event reaches the router
        assert!(router.targets(f.org, "soporte").await.unwrap().is_empty());

        router
            .invalidate(&HitlEvent::UserAssigned {
                organization_id: f.org,
                hitl_type_id: soporte.id,
                name: "soporte".into(),
                user_id: agent.id,
                timestamp: chrono::Utc::now(),
            })
            .await;
        assert_eq!(router.cached_entries().await, 0);

        let users = router.targets(f.org, "soporte").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "ana@acme.test");
    }

    #[tokio::test]
    async fn test_invalidation_is_scoped_to_organization() {
        let f = setup();
        let router = EscalationRouter::new(f.hitl.clone());
        let other_org = f.db.create_organization("Globex").unwrap().id;

        router.targets(f.org, "soporte").await.unwrap();
        router.targets(other_org, "soporte").await.unwrap();
        assert_eq!(router.cached_entries().await, 2);

        router
            .invalidate(&HitlEvent::TypeDeleted {
                organization_id: f.org,
                hitl_type_id: 1,
                name: "soporte".into(),
                timestamp: chrono::Utc::now(),
            })
            .await;
        assert_eq!(router.cached_entries().await, 1);
    }

    #[tokio::test]
    async fn test_run_invalidates_on_bus_events() {
        let f = setup();
        let router = Arc::new(EscalationRouter::new(f.hitl.clone()));
        let handle = router.spawn(f.bus.subscribe("escalation-router"));

        router.targets(f.org, "ventas").await.unwrap();
        assert_eq!(router.cached_entries().await, 1);

        f.hitl
            .create(&f.owner, f.org, NewHitlType { name: "ventas".into(), description: None })
            .unwrap();

        for _ in 0..50 {
            if router.cached_entries().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(router.cached_entries().await, 0);

        handle.abort();
    }
}

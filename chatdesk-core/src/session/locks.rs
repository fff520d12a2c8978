//! Per-conversation serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed async locks, one per conversation currently being resolved.
///
/// Entries are created on demand and dropped once no task holds or waits on
/// them, so the map only grows with the number of concurrently busy
/// conversations. Waiters that are cancelled before getting the lock give
/// their registration back as well.
#[derive(Debug, Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<i64, Slot>>,
}

#[derive(Debug)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Tasks holding or waiting on `mutex`
    users: usize,
}

/// Counts one user of a slot until dropped.
struct Registration<'a> {
    registry: &'a ConversationLocks,
    conversation_id: i64,
}

/// Guard returned by [`ConversationLocks::acquire`].
pub struct ConversationGuard<'a> {
    // Field order matters: the mutex is released before the registration.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration<'a>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds the lock for `conversation_id`.
    pub async fn acquire(&self, conversation_id: i64) -> ConversationGuard<'_> {
        let mutex = {
            let mut locks = self.lock_map();
            let slot = locks.entry(conversation_id).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        let registration = Registration {
            registry: self,
            conversation_id,
        };

        let guard = mutex.lock_owned().await;

        ConversationGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Number of conversations with a live lock entry.
    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Slot>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut locks = self.registry.lock_map();
        if let Some(slot) = locks.get_mut(&self.conversation_id) {
            slot.users -= 1;
            if slot.users == 0 {
                locks.remove(&self.conversation_id);
            }
        }
    }
}

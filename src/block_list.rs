use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::ChatResult;
use crate::gateway::Gateway;
use crate::models::Id;

/// Blocked-user set of the current user.
///
/// Writers swap in a fresh `Arc<HashSet>`; readers hold an immutable
/// snapshot, so a visibility pass never observes a half-applied change.
pub struct BlockListFilter {
    gateway: Arc<dyn Gateway>,
    blocked: RwLock<Arc<HashSet<Id>>>,
}

impl BlockListFilter {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway, blocked: RwLock::new(Arc::new(HashSet::new())) }
    }

    pub fn snapshot(&self) -> Arc<HashSet<Id>> {
        self.blocked.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_blocked(&self, user_id: Id) -> bool {
        self.snapshot().contains(&user_id)
    }

    pub fn blocked_users(&self) -> Vec<Id> {
        self.snapshot().iter().copied().collect()
    }

    /// Replace the local set with the server's. Always authoritative.
    pub async fn load_blocked(&self) -> ChatResult<Arc<HashSet<Id>>> {
        let relations = self.gateway.list_blocked_users().await?;
        let set: HashSet<Id> = relations.into_iter().map(|r| r.blocked_user_id).collect();
        debug!(count = set.len(), "blocked users loaded");
        let set = Arc::new(set);
        *self.blocked.write().unwrap_or_else(PoisonError::into_inner) = set.clone();
        Ok(set)
    }

    pub async fn block(&self, user_id: Id) -> ChatResult<()> {
        let changed = self.set_local(user_id, true);
        self.persist(user_id, true, changed).await
    }

    pub async fn unblock(&self, user_id: Id) -> ChatResult<()> {
        let changed = self.set_local(user_id, false);
        self.persist(user_id, false, changed).await
    }

    /// Optimistic local change. Returns whether the set changed.
    pub fn set_local(&self, user_id: Id, blocked: bool) -> bool {
        if blocked {
            self.update(|s| s.insert(user_id))
        } else {
            self.update(|s| s.remove(&user_id))
        }
    }

    /// Send a change made with [`set_local`](Self::set_local) to the backend.
    /// A rejected change is undone locally when it had changed the set.
    pub async fn persist(&self, user_id: Id, blocked: bool, changed: bool) -> ChatResult<()> {
        let result = if blocked {
            self.gateway.block_user(user_id).await.map(|_| ())
        } else {
            self.gateway.unblock_user(user_id).await.map(|_| ())
        };
        if let Err(e) = result {
            if changed {
                self.set_local(user_id, !blocked);
            }
            return Err(e.into());
        }
        info!(user = %user_id, blocked, "block list updated");
        Ok(())
    }

    // copy-on-write; returns whatever the mutation reported
    fn update<F: FnOnce(&mut HashSet<Id>) -> bool>(&self, f: F) -> bool {
        let mut guard = self.blocked.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashSet::clone(&guard);
        let changed = f(&mut next);
        if changed {
            *guard = Arc::new(next);
        }
        changed
    }
}

//! Group membership lookup.
//!
//! Group administration lives elsewhere; the router only needs to know who
//! is in a group when fanning out.

use crate::error::Result;
use crate::store::{KeyStore, Keyspace};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Source of group membership.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Members of a group, in no particular order. Unknown groups are empty.
    async fn members(&self, group_id: &str) -> Result<Vec<String>>;

    /// Whether `user_id` belongs to `group_id`.
    async fn is_member(&self, group_id: &str, user_id: &str) -> Result<bool>;

    /// Add a member. Returns false if already present.
    async fn add_member(&self, group_id: &str, user_id: &str) -> Result<bool>;

    /// Remove a member. Returns false if absent.
    async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<bool>;
}

/// Group directory kept as sets in the shared [`KeyStore`].
#[derive(Clone)]
pub struct StoreDirectory {
    store: Arc<dyn KeyStore>,
    keys: Keyspace,
}

impl StoreDirectory {
    #[must_use]
    pub fn new(store: Arc<dyn KeyStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }
}

#[async_trait]
impl GroupDirectory for StoreDirectory {
    async fn members(&self, group_id: &str) -> Result<Vec<String>> {
        Ok(self.store.smembers(&self.keys.group_members(group_id)).await?)
    }

    async fn is_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .store
            .sismember(&self.keys.group_members(group_id), user_id)
            .await?)
    }

    async fn add_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let added = self
            .store
            .sadd(&self.keys.group_members(group_id), user_id)
            .await?;
        if added {
            debug!(group = %group_id, user = %user_id, "Member added");
        }
        Ok(added)
    }

    async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let removed = self
            .store
            .srem(&self.keys.group_members(group_id), user_id)
            .await?;
        if removed {
            debug!(group = %group_id, user = %user_id, "Member removed");
        }
        Ok(removed)
    }
}

//! In-process [`MessageArchive`].

use super::{DeliveryRecord, MessageArchive};
use crate::error::Result;
use async_trait::async_trait;
use courier_protocol::{DeliveryItem, Envelope, MessageStatus, Scope};
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Archive kept in memory; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    envelopes: DashMap<String, Envelope>,
    inboxes: DashMap<Scope, BTreeMap<u64, String>>,
}

impl MemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

#[async_trait]
impl MessageArchive for MemoryArchive {
    async fn store(&self, envelope: &Envelope, deliveries: &[DeliveryRecord]) -> Result<()> {
        self.envelopes
            .insert(envelope.message_id.clone(), envelope.clone());
        for record in deliveries {
            self.inboxes
                .entry(record.scope.clone())
                .or_default()
                .insert(record.sequence, envelope.message_id.clone());
        }
        Ok(())
    }

    async fn envelope(&self, message_id: &str) -> Result<Option<Envelope>> {
        Ok(self.envelopes.get(message_id).map(|e| e.clone()))
    }

    async fn range(&self, scope: &Scope, after: u64, limit: usize) -> Result<Vec<DeliveryItem>> {
        let Some(inbox) = self.inboxes.get(scope) else {
            return Ok(Vec::new());
        };
        Ok(inbox
            .range(after.saturating_add(1)..)
            .filter_map(|(&sequence, id)| {
                self.envelopes.get(id).map(|envelope| DeliveryItem {
                    scope: scope.clone(),
                    sequence,
                    envelope: envelope.clone(),
                })
            })
            .take(limit)
            .collect())
    }

    async fn max_sequence(&self, scope: &Scope) -> Result<u64> {
        Ok(self
            .inboxes
            .get(scope)
            .and_then(|inbox| inbox.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn set_status(&self, message_id: &str, status: MessageStatus) -> Result<bool> {
        match self.envelopes.get_mut(message_id) {
            Some(mut envelope) => {
                envelope.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

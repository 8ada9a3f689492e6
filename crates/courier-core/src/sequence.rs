//! Per-scope sequence allocation.
//!
//! Each scope (a user inbox or a group timeline) owns one counter in the
//! shared store. Allocation is a single atomic increment, so concurrent
//! callers on any node never observe the same value. A sequence that is
//! allocated but never consumed leaves a permanent gap; readers must expect
//! gaps.

use crate::error::Result;
use crate::store::{KeyStore, Keyspace};
use courier_protocol::Scope;
use std::sync::Arc;
use tracing::trace;

/// Issues strictly increasing sequence numbers per scope.
#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<dyn KeyStore>,
    keys: Keyspace,
}

impl SequenceAllocator {
    /// Create an allocator over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Allocate the next sequence number of `scope`. The first value is 1.
    ///
    /// # Errors
    ///
    /// Propagates store failures unchanged.
    pub async fn next(&self, scope: &Scope) -> Result<u64> {
        let seq = self.store.incr(&self.keys.sequence(&scope.to_string())).await?;
        trace!(scope = %scope, seq, "Allocated sequence");
        Ok(seq)
    }

    /// Highest sequence allocated so far, 0 if none.
    ///
    /// # Errors
    ///
    /// Propagates store failures unchanged.
    pub async fn current(&self, scope: &Scope) -> Result<u64> {
        let raw = self.store.get(&self.keys.sequence(&scope.to_string())).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    fn allocator() -> SequenceAllocator {
        SequenceAllocator::new(Arc::new(MemoryStore::new()), Keyspace::default())
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let alloc = allocator();
        let u1 = Scope::user("u1");
        let g1 = Scope::group("u1");

        assert_eq!(alloc.next(&u1).await.unwrap(), 1);
        assert_eq!(alloc.next(&u1).await.unwrap(), 2);
        assert_eq!(alloc.next(&g1).await.unwrap(), 1);
        assert_eq!(alloc.current(&u1).await.unwrap(), 2);
        assert_eq!(alloc.current(&Scope::user("nobody")).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_is_distinct() {
        let alloc = allocator();
        let scope = Scope::group("busy");

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let alloc = alloc.clone();
                let scope = scope.clone();
                tokio::spawn(async move { alloc.next(&scope).await.unwrap() })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(seen.iter().max(), Some(&200));
    }

    #[tokio::test]
    async fn test_sequential_calls_increase() {
        let alloc = allocator();
        let scope = Scope::user("u1");
        let mut last = 0;
        for _ in 0..10 {
            let seq = alloc.next(&scope).await.unwrap();
            assert!(seq > last);
            last = seq;
        }
    }
}

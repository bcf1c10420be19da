// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Set of values this node has already accepted.
//!
//! The [`DedupStore`] is the single source of truth for whether a value has
//! been processed before. Values are never removed once inserted.

use std::collections::HashSet;

use tokio::sync::RwLock;

use crate::Value;

/// Concurrency-safe, insert-only set of seen values.
#[derive(Debug, Default)]
pub struct DedupStore {
    seen: RwLock<HashSet<Value>>,
}

impl DedupStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically inserts `value` unless it is already known.
    ///
    /// Returns `true` iff the value was newly inserted.
    pub async fn contains_or_insert(&self, value: Value) -> bool {
        self.seen.write().await.insert(value)
    }

    /// Inserts all given values under a single write lock.
    ///
    /// Returns the number of values that were newly inserted.
    pub async fn insert_all(&self, values: impl IntoIterator<Item = Value>) -> usize {
        let mut guard = self.seen.write().await;
        values.into_iter().filter(|v| guard.insert(*v)).count()
    }

    /// Returns a point-in-time copy of all known values, in no particular order.
    pub async fn snapshot(&self) -> Vec<Value> {
        self.seen.read().await.iter().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.read().await.is_empty()
    }
}

//! Request-only relationships layered over store reads.

use crate::{
    error::Result,
    models::{Tuple, TupleFilter},
    repository::RelationshipReader,
    snapshot::SnapshotToken,
};
use ahash::AHashSet;
use std::sync::Arc;

/// Ephemeral tuples supplied with a single request. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct ContextualTuples {
    tuples: Arc<[Tuple]>,
}

impl ContextualTuples {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        let mut seen = AHashSet::with_capacity(tuples.len());
        let tuples: Vec<Tuple> = tuples.into_iter().filter(|t| seen.insert(t.clone())).collect();
        Self {
            tuples: tuples.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn matching<'a>(&'a self, filter: &'a TupleFilter) -> impl Iterator<Item = &'a Tuple> + 'a {
        self.tuples.iter().filter(move |t| filter.matches(t))
    }
}

/// Store reads merged with the request's contextual tuples.
#[derive(Clone)]
pub struct OverlayReader {
    store: Arc<dyn RelationshipReader>,
    contextual: ContextualTuples,
}

impl OverlayReader {
    pub fn new(store: Arc<dyn RelationshipReader>, contextual: ContextualTuples) -> Self {
        Self { store, contextual }
    }

    /// Union of stored and contextual tuples matching `filter`, without
    /// duplicates. Stored tuples come first, in store order.
    pub async fn query(&self, filter: &TupleFilter, snapshot: &SnapshotToken) -> Result<Vec<Tuple>> {
        let stored = self.store.query_relationships(filter, snapshot).await?;

        let mut seen = AHashSet::with_capacity(stored.len());
        let mut tuples: Vec<Tuple> = stored
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if self.contextual.is_empty() {
            return Ok(tuples);
        }

        for tuple in self.contextual.matching(filter) {
            if seen.insert(tuple.clone()) {
                tuples.push(tuple.clone());
            }
        }
        Ok(tuples)
    }
}

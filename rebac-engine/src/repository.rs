use crate::{
    error::{EngineError, Result},
    models::{Tuple, TupleFilter},
    snapshot::{SnapshotToken, SnapshotTokenService},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

/// Read side of a relationship store.
///
/// Every call within one request passes the same snapshot token and must see
/// the same state for it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelationshipReader: Send + Sync {
    /// Tuples matching `filter` as of `snapshot`.
    async fn query_relationships(
        &self,
        filter: &TupleFilter,
        snapshot: &SnapshotToken,
    ) -> Result<Vec<Tuple>>;
}

#[derive(Debug, Clone)]
struct Record {
    tuple: Tuple,
    created: u64,
    deleted: Option<u64>,
}

impl Record {
    fn visible_at(&self, revision: u64) -> bool {
        self.created <= revision && self.deleted.map_or(true, |d| d > revision)
    }

    fn is_live(&self) -> bool {
        self.deleted.is_none()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    revision: u64,
    records: Vec<Record>,
}

/// In-memory multi-version tuple store for testing and embedding.
///
/// Each write or delete produces a new revision; reads at an older snapshot
/// keep seeing the state of that revision.
#[derive(Debug, Default)]
pub struct MemoryRelationshipStore {
    state: RwLock<StoreState>,
}

impl MemoryRelationshipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with tuples in text notation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTuple` if any entry fails to parse.
    pub fn from_notation<'a>(tuples: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let store = Self::new();
        let tuples = tuples
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<Tuple>>>()?;
        store.write(tuples);
        Ok(store)
    }

    /// Write tuples, returning the snapshot that first contains them.
    /// Tuples that already exist are left untouched.
    pub fn write(&self, tuples: impl IntoIterator<Item = Tuple>) -> SnapshotToken {
        let mut state = self.state.write();
        state.revision += 1;
        let revision = state.revision;

        for tuple in tuples {
            let exists = state
                .records
                .iter()
                .any(|r| r.is_live() && r.tuple == tuple);
            if !exists {
                debug!("Writing tuple: {}", tuple);
                state.records.push(Record {
                    tuple,
                    created: revision,
                    deleted: None,
                });
            }
        }

        SnapshotToken::from_revision(revision)
    }

    /// Delete every live tuple matching `filter`, returning the snapshot
    /// from which they are gone.
    pub fn delete(&self, filter: &TupleFilter) -> SnapshotToken {
        let mut state = self.state.write();
        state.revision += 1;
        let revision = state.revision;

        for record in state
            .records
            .iter_mut()
            .filter(|r| r.is_live() && filter.matches(&r.tuple))
        {
            debug!("Deleting tuple: {}", record.tuple);
            record.deleted = Some(revision);
        }

        SnapshotToken::from_revision(revision)
    }

    pub fn head(&self) -> SnapshotToken {
        SnapshotToken::from_revision(self.state.read().revision)
    }
}

#[async_trait]
impl RelationshipReader for MemoryRelationshipStore {
    async fn query_relationships(
        &self,
        filter: &TupleFilter,
        snapshot: &SnapshotToken,
    ) -> Result<Vec<Tuple>> {
        let state = self.state.read();
        let revision = snapshot.revision();
        if revision > state.revision {
            return Err(EngineError::InvalidSnapshotToken(snapshot.to_string()));
        }

        Ok(state
            .records
            .iter()
            .filter(|r| r.visible_at(revision) && filter.matches(&r.tuple))
            .map(|r| r.tuple.clone())
            .collect())
    }
}

#[async_trait]
impl SnapshotTokenService for MemoryRelationshipStore {
    async fn head_token(&self) -> Result<SnapshotToken> {
        Ok(self.head())
    }

    async fn validate_token(&self, token: &SnapshotToken) -> Result<()> {
        if token.revision() > self.state.read().revision {
            return Err(EngineError::InvalidSnapshotToken(format!(
                "{token} is ahead of the store head"
            )));
        }
        Ok(())
    }
}

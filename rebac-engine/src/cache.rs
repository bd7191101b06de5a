//! Memoization private to one top-level request.
//!
//! A cache lives exactly as long as its request scope, so every entry was
//! computed under the same snapshot and the same contextual tuples. Only
//! definitive results are stored, plus the largest depth budget at which a
//! check ran out of depth. A smaller budget cannot succeed where a larger
//! one failed, so re-entering such a check fails at once instead of walking
//! the same cycle again.

use crate::{
    expand::UsersetTree,
    models::{Decision, EntityRef, SubjectRef},
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckKey {
    pub entity: EntityRef,
    pub name: String,
    pub subject: SubjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpandKey {
    pub entity: EntityRef,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct RequestCache {
    checks: DashMap<CheckKey, Decision>,
    expansions: DashMap<ExpandKey, UsersetTree>,
    exhausted: DashMap<CheckKey, u32>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_check(&self, key: &CheckKey) -> Option<Decision> {
        let found = self.checks.get(key).map(|entry| *entry.value());
        self.record(found.is_some());
        found
    }

    pub fn put_check(&self, key: CheckKey, decision: Decision) {
        self.checks.insert(key, decision);
    }

    /// Remember that `key` ran out of depth with `remaining_depth` left.
    pub fn put_exhausted(&self, key: CheckKey, remaining_depth: u32) {
        self.exhausted
            .entry(key)
            .and_modify(|depth| *depth = (*depth).max(remaining_depth))
            .or_insert(remaining_depth);
    }

    /// Whether `key` already ran out of depth with at least `remaining_depth`
    /// to spend.
    pub fn is_exhausted(&self, key: &CheckKey, remaining_depth: u32) -> bool {
        self.exhausted
            .get(key)
            .is_some_and(|depth| *depth.value() >= remaining_depth)
    }

    pub fn get_expand(&self, key: &ExpandKey) -> Option<UsersetTree> {
        let found = self.expansions.get(key).map(|entry| entry.value().clone());
        self.record(found.is_some());
        found
    }

    pub fn put_expand(&self, key: ExpandKey, tree: UsersetTree) {
        self.expansions.insert(key, tree);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.checks.len() + self.expansions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rebac_cache_hits_total").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

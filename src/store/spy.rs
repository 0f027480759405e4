//! Counting wrapper around any [`ActionStore`], for asserting which paths
//! touch persistence at all.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ActionStore, CommitReport, PurgeReport, StoreError};
use crate::types::{
    ActionFilter, ActionPage, ActionProposal, ActionStatus, ActionSummary, ActionType,
    ActionUpdate, ApplyToken, PendingAction,
};

pub struct SpyStore<S> {
    inner: S,
    reads: AtomicUsize,
    writes: AtomicUsize,
    commits: AtomicUsize,
}

impl<S: ActionStore> SpyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.reads() + self.writes()
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
        self.commits.store(0, Ordering::SeqCst);
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl<S: ActionStore> ActionStore for SpyStore<S> {
    async fn insert_action(
        &self,
        proposal: &ActionProposal,
        now: DateTime<Utc>,
    ) -> Result<PendingAction, StoreError> {
        self.write();
        self.inner.insert_action(proposal, now).await
    }

    async fn find_open_duplicate(
        &self,
        email_id: i64,
        action_type: ActionType,
    ) -> Result<Option<i64>, StoreError> {
        self.read();
        self.inner.find_open_duplicate(email_id, action_type).await
    }

    async fn get_action(&self, id: i64) -> Result<Option<PendingAction>, StoreError> {
        self.read();
        self.inner.get_action(id).await
    }

    async fn get_actions(&self, ids: &BTreeSet<i64>) -> Result<Vec<PendingAction>, StoreError> {
        self.read();
        self.inner.get_actions(ids).await
    }

    async fn list_actions(&self, filter: &ActionFilter) -> Result<ActionPage, StoreError> {
        self.read();
        self.inner.list_actions(filter).await
    }

    async fn approved_actions(&self, limit: usize) -> Result<Vec<PendingAction>, StoreError> {
        self.read();
        self.inner.approved_actions(limit).await
    }

    async fn summary(&self) -> Result<ActionSummary, StoreError> {
        self.read();
        self.inner.summary().await
    }

    async fn record_decision(
        &self,
        id: i64,
        status: ActionStatus,
        decided_by: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.write();
        self.inner.record_decision(id, status, decided_by, at).await
    }

    async fn insert_token(&self, token: &ApplyToken) -> Result<(), StoreError> {
        self.write();
        self.inner.insert_token(token).await
    }

    async fn find_token(&self, token_hash: &str) -> Result<Option<ApplyToken>, StoreError> {
        self.read();
        self.inner.find_token(token_hash).await
    }

    async fn commit_apply(
        &self,
        updates: &[ActionUpdate],
        consume_token: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<CommitReport, StoreError> {
        self.write();
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit_apply(updates, consume_token, at).await
    }

    async fn purge(
        &self,
        now: DateTime<Utc>,
        actions_before: Option<DateTime<Utc>>,
    ) -> Result<PurgeReport, StoreError> {
        self.write();
        self.inner.purge(now, actions_before).await
    }
}

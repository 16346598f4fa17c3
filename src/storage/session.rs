//! Transactional sessions over a pluggable storage backend.
//!
//! A [`Session`] couples one backend connection with a [`ChangeTracker`] and
//! at most one live [`Transaction`]. Sessions are opened by a
//! [`SessionFactory`] and owned by exactly one unit of work.

use crate::errors::{Result, StorageError};
use crate::storage::entity::{EntityGraph, EntityState, GraphNode};
use crate::storage::tracker::{ChangeTracker, PendingChange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Status of an explicit transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    /// Replaced by a fresh transaction before it finished.
    Superseded,
}

#[derive(Debug)]
struct TransactionInner {
    id: Uuid,
    started_at: DateTime<Utc>,
    status: Mutex<TransactionStatus>,
}

/// Handle to an explicit transaction. Clones share identity.
#[derive(Debug, Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4(),
                started_at: Utc::now(),
                status: Mutex::new(TransactionStatus::Active),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn status(&self) -> TransactionStatus {
        *lock(&self.inner.status)
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Whether both handles refer to the same transaction.
    pub fn same_as(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn finish(&self, status: TransactionStatus) {
        *lock(&self.inner.status) = status;
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Transaction {}

/// Connection-level operations a session needs from its store.
///
/// A backend instance serves exactly one session, so it may keep
/// per-transaction state of its own.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Load every row of an entity set as visible to `transaction`.
    async fn load_set(
        &self,
        set: &'static str,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<(String, Value)>>;

    /// Load one row of an entity set as visible to `transaction`.
    async fn load(
        &self,
        set: &'static str,
        key: &str,
        transaction: Option<&Transaction>,
    ) -> Result<Option<Value>>;

    /// Write all changes atomically, inside `transaction` when one is given.
    /// Returns the number of state entries written.
    async fn write(
        &self,
        changes: &[PendingChange],
        transaction: Option<&Transaction>,
    ) -> Result<usize>;

    async fn begin(&self) -> Result<Transaction>;

    async fn commit(&self, transaction: &Transaction) -> Result<()>;

    async fn rollback(&self, transaction: &Transaction) -> Result<()>;

    /// Return the connection; any unfinished transaction is discarded.
    fn release(&self);
}

/// Opens sessions against a configured store
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Session>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live connection with change tracking and an optional transaction.
pub struct Session {
    id: Uuid,
    backend: Box<dyn SessionBackend>,
    tracker: Mutex<ChangeTracker>,
    transaction: Mutex<Option<Transaction>>,
}

impl Session {
    pub fn new(backend: Box<dyn SessionBackend>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            tracker: Mutex::new(ChangeTracker::new()),
            transaction: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Rows of an entity set, with tracked entities resolved to their
    /// tracked values, staged deletions hidden and staged inserts appended.
    pub async fn query(&self, set: &'static str) -> Result<Vec<Value>> {
        let transaction = self.current_transaction();
        let rows = self.backend.load_set(set, transaction.as_ref()).await?;

        let mut tracker = lock(&self.tracker);
        let mut loaded = HashSet::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if let Some(value) = tracker.attach(set, key.clone(), value) {
                values.push(value);
            }
            loaded.insert(key);
        }
        values.extend(
            tracker
                .added(set)
                .into_iter()
                .filter(|(key, _)| !loaded.contains(key))
                .map(|(_, value)| value),
        );
        Ok(values)
    }

    pub async fn find(&self, set: &'static str, key: &str) -> Result<Option<Value>> {
        let transaction = self.current_transaction();
        let row = self.backend.load(set, key, transaction.as_ref()).await?;

        let mut tracker = lock(&self.tracker);
        Ok(match row {
            Some(value) => tracker.attach(set, key.to_string(), value),
            None => tracker.added_value(set, key),
        })
    }

    pub fn add(&self, set: &'static str, key: String, value: Value) -> Result<()> {
        lock(&self.tracker).add(set, key, value)
    }

    pub fn update(&self, set: &'static str, key: String, value: Value) -> Result<()> {
        lock(&self.tracker).update(set, key, value)
    }

    pub fn remove(&self, set: &'static str, key: String, value: Value) {
        lock(&self.tracker).remove(set, key, value)
    }

    pub fn state_of(&self, set: &'static str, key: &str) -> EntityState {
        lock(&self.tracker).state_of(set, key)
    }

    pub fn pending_changes(&self) -> Vec<PendingChange> {
        lock(&self.tracker).pending()
    }

    /// Forget every tracked entity, staged changes included.
    pub fn discard_changes(&self) {
        lock(&self.tracker).clear();
    }

    pub fn auto_detect_changes(&self) -> bool {
        lock(&self.tracker).auto_detect()
    }

    pub fn set_auto_detect_changes(&self, value: bool) {
        lock(&self.tracker).set_auto_detect(value);
    }

    /// Attach every node of a disconnected graph with the state chosen by
    /// `classifier`.
    pub fn track_graph<F>(&self, graph: &EntityGraph, mut classifier: F)
    where
        F: FnMut(&GraphNode) -> EntityState,
    {
        let mut tracker = lock(&self.tracker);
        for node in graph.nodes() {
            let state = classifier(node);
            tracker.set_state(node.set, node.key.clone(), node.value.clone(), state);
        }
    }

    /// Write every pending change. Returns the number of entries written.
    pub async fn save_changes(&self) -> Result<usize> {
        self.save_changes_audited(|_| Ok(Vec::new())).await
    }

    /// Write every pending change together with the audit rows `audit`
    /// derives from them, in one backend write. Audit rows are not tracked.
    pub async fn save_changes_audited<F>(&self, audit: F) -> Result<usize>
    where
        F: FnOnce(&[PendingChange]) -> Result<Vec<PendingChange>> + Send,
    {
        let pending = self.pending_changes();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut batch = pending.clone();
        batch.extend(audit(&pending)?);

        let transaction = self.current_transaction();
        let written = self.backend.write(&batch, transaction.as_ref()).await?;
        lock(&self.tracker).accept(&pending);
        Ok(written)
    }

    /// The live transaction, if any.
    pub fn current_transaction(&self) -> Option<Transaction> {
        lock(&self.transaction)
            .as_ref()
            .filter(|transaction| transaction.is_active())
            .cloned()
    }

    /// Start a transaction. A live one is superseded: rolled back and
    /// replaced by the new handle.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        if let Some(previous) = self.current_transaction() {
            tracing::warn!(
                session_id = %self.id,
                transaction_id = %previous.id(),
                "superseding live transaction"
            );
            self.backend.rollback(&previous).await?;
            previous.finish(TransactionStatus::Superseded);
        }

        let transaction = self.backend.begin().await?;
        *lock(&self.transaction) = Some(transaction.clone());
        tracing::debug!(session_id = %self.id, transaction_id = %transaction.id(), "transaction started");
        Ok(transaction)
    }

    pub async fn commit_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_current(transaction)?;
        self.backend.commit(transaction).await?;
        transaction.finish(TransactionStatus::Committed);
        lock(&self.transaction).take();
        tracing::debug!(session_id = %self.id, transaction_id = %transaction.id(), "transaction committed");
        Ok(())
    }

    pub async fn rollback_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_current(transaction)?;
        self.backend.rollback(transaction).await?;
        transaction.finish(TransactionStatus::RolledBack);
        lock(&self.transaction).take();
        tracing::debug!(session_id = %self.id, transaction_id = %transaction.id(), "transaction rolled back");
        Ok(())
    }

    fn ensure_current(&self, transaction: &Transaction) -> Result<()> {
        match self.current_transaction() {
            Some(current) if current.same_as(transaction) => Ok(()),
            _ => Err(StorageError::TransactionFailed(format!(
                "transaction {} is not the live transaction of session {}",
                transaction.id(),
                self.id
            ))),
        }
    }

    /// Drop tracked state and return the connection.
    pub fn release(&self) {
        lock(&self.tracker).clear();
        if let Some(transaction) = lock(&self.transaction).take() {
            if transaction.is_active() {
                transaction.finish(TransactionStatus::RolledBack);
            }
        }
        self.backend.release();
    }
}

/// Shared, revocable access to a session.
///
/// Repositories and identity accessors hold a lease rather than the session
/// itself, so disposing the owning unit of work cuts all of them off at once.
pub struct SessionLease {
    session: Session,
    disposed: AtomicBool,
}

impl SessionLease {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> Result<&Session> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::Disposed);
        }
        Ok(&self.session)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Revoke the lease and release the session. Returns `false` when the
    /// lease was already revoked.
    pub(crate) fn revoke(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.session.release();
        true
    }
}

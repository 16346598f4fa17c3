//! In-memory entity store and session backend.

use crate::errors::{Result, StorageError};
use crate::storage::entity::{EntityState, UniqueIndex};
use crate::storage::session::{Session, SessionBackend, SessionFactory, Transaction, lock};
use crate::storage::tracker::PendingChange;
use crate::storage::unit_of_work::unique_indexes;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

type Rows = BTreeMap<String, Value>;

/// Shared in-memory entity store. Clones share the same data.
///
/// Writes enforce the unique indexes of every registered entity type, the
/// same ones the PostgreSQL migrations create.
#[derive(Clone)]
pub struct MemoryStore {
    sets: Arc<RwLock<HashMap<&'static str, Rows>>>,
    indexes: Arc<Vec<UniqueIndex>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_indexes(unique_indexes())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_indexes(indexes: Vec<UniqueIndex>) -> Self {
        Self {
            sets: Arc::new(RwLock::new(HashMap::new())),
            indexes: Arc::new(indexes),
        }
    }

    fn rows_of(sets: &HashMap<&'static str, Rows>, set: &'static str) -> Rows {
        sets.get(set).cloned().unwrap_or_default()
    }

    /// Number of rows in an entity set.
    pub fn count(&self, set: &'static str) -> usize {
        self.read(|sets| sets.get(set).map(BTreeMap::len).unwrap_or(0))
    }

    pub fn contains(&self, set: &'static str, key: &str) -> bool {
        self.read(|sets| sets.get(set).is_some_and(|rows| rows.contains_key(key)))
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<&'static str, Rows>) -> T) -> T {
        let sets = self
            .sets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&sets)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<&'static str, Rows>) -> T) -> T {
        let mut sets = self
            .sets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut sets)
    }
}

/// Uncommitted writes of one transaction; `None` marks a deleted row.
type Overlay = HashMap<&'static str, BTreeMap<String, Option<Value>>>;

fn overlay_lookup<'a>(overlay: &'a Overlay, set: &str, key: &str) -> Option<&'a Option<Value>> {
    overlay.get(set).and_then(|rows| rows.get(key))
}

fn apply_overlay(rows: &mut Rows, overlay_rows: &BTreeMap<String, Option<Value>>) {
    for (key, value) in overlay_rows {
        match value {
            Some(value) => {
                rows.insert(key.clone(), value.clone());
            }
            None => {
                rows.remove(key);
            }
        }
    }
}

fn apply_changes(rows: &mut Rows, changes: &[PendingChange], set: &'static str) {
    for change in changes.iter().filter(|change| change.set == set) {
        if change.state == EntityState::Deleted {
            rows.remove(&change.key);
        } else {
            rows.insert(change.key.clone(), change.value.clone());
        }
    }
}

/// Fail when two rows share a string value of the indexed field. Rows where
/// the field is missing or not a string are skipped.
fn ensure_distinct(index: &UniqueIndex, rows: &Rows) -> Result<()> {
    let mut seen = HashSet::new();
    for value in rows
        .values()
        .filter_map(|row| row.get(index.field))
        .filter_map(Value::as_str)
    {
        if !seen.insert(value) {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate {} '{}' in {}",
                index.field, value, index.set
            )));
        }
    }
    Ok(())
}

fn validate(
    changes: &[PendingChange],
    exists: impl Fn(&'static str, &str) -> bool,
) -> Result<()> {
    for change in changes {
        let present = exists(change.set, &change.key);
        match change.state {
            EntityState::Added if present => {
                return Err(StorageError::ConstraintViolation(format!(
                    "duplicate key {} in {}",
                    change.key, change.set
                )));
            }
            EntityState::Modified | EntityState::Deleted if !present => {
                return Err(StorageError::ConcurrencyConflict(format!(
                    "{} {} does not exist",
                    change.set, change.key
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Session backend over a [`MemoryStore`].
pub struct MemoryBackend {
    store: MemoryStore,
    transactions: Mutex<HashMap<Uuid, Overlay>>,
    released: AtomicBool,
}

impl MemoryBackend {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            transactions: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(StorageError::ConnectionFailed(
                "memory session already released".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn load_set(
        &self,
        set: &'static str,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<(String, Value)>> {
        self.ensure_open()?;
        let mut rows = self.store.read(|sets| MemoryStore::rows_of(sets, set));

        if let Some(transaction) = transaction {
            let transactions = lock(&self.transactions);
            if let Some(overlay_rows) = transactions
                .get(&transaction.id())
                .and_then(|overlay| overlay.get(set))
            {
                apply_overlay(&mut rows, overlay_rows);
            }
        }

        Ok(rows.into_iter().collect())
    }

    async fn load(
        &self,
        set: &'static str,
        key: &str,
        transaction: Option<&Transaction>,
    ) -> Result<Option<Value>> {
        self.ensure_open()?;
        if let Some(transaction) = transaction {
            let transactions = lock(&self.transactions);
            if let Some(value) = transactions
                .get(&transaction.id())
                .and_then(|overlay| overlay_lookup(overlay, set, key))
            {
                return Ok(value.clone());
            }
        }
        Ok(self
            .store
            .read(|sets| sets.get(set).and_then(|rows| rows.get(key)).cloned()))
    }

    async fn write(
        &self,
        changes: &[PendingChange],
        transaction: Option<&Transaction>,
    ) -> Result<usize> {
        self.ensure_open()?;

        let indexes = self.store.indexes.clone();
        let touched: Vec<&UniqueIndex> = indexes
            .iter()
            .filter(|index| changes.iter().any(|change| change.set == index.set))
            .collect();

        let Some(transaction) = transaction else {
            // Validate and apply under one write lock so the commit is atomic.
            return self.store.write(|sets| -> Result<usize> {
                validate(changes, |set, key| {
                    sets.get(set).is_some_and(|rows| rows.contains_key(key))
                })?;
                for index in &touched {
                    let mut rows = MemoryStore::rows_of(sets, index.set);
                    apply_changes(&mut rows, changes, index.set);
                    ensure_distinct(index, &rows)?;
                }
                for change in changes {
                    let rows = sets.entry(change.set).or_default();
                    if change.state == EntityState::Deleted {
                        rows.remove(&change.key);
                    } else {
                        rows.insert(change.key.clone(), change.value.clone());
                    }
                }
                Ok(changes.len())
            });
        };

        let mut transactions = lock(&self.transactions);
        let overlay = transactions.get_mut(&transaction.id()).ok_or_else(|| {
            StorageError::TransactionFailed(format!(
                "transaction {} is not active",
                transaction.id()
            ))
        })?;

        let view: &Overlay = overlay;
        self.store.read(|sets| -> Result<()> {
            validate(changes, |set, key| match overlay_lookup(view, set, key) {
                Some(value) => value.is_some(),
                None => sets.get(set).is_some_and(|rows| rows.contains_key(key)),
            })?;
            for index in &touched {
                let mut rows = MemoryStore::rows_of(sets, index.set);
                if let Some(overlay_rows) = view.get(index.set) {
                    apply_overlay(&mut rows, overlay_rows);
                }
                apply_changes(&mut rows, changes, index.set);
                ensure_distinct(index, &rows)?;
            }
            Ok(())
        })?;

        for change in changes {
            let value = match change.state {
                EntityState::Deleted => None,
                _ => Some(change.value.clone()),
            };
            overlay
                .entry(change.set)
                .or_default()
                .insert(change.key.clone(), value);
        }
        Ok(changes.len())
    }

    async fn begin(&self) -> Result<Transaction> {
        self.ensure_open()?;
        let transaction = Transaction::new();
        lock(&self.transactions).insert(transaction.id(), Overlay::new());
        Ok(transaction)
    }

    async fn commit(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_open()?;
        let overlay = lock(&self.transactions)
            .remove(&transaction.id())
            .ok_or_else(|| {
                StorageError::TransactionFailed(format!(
                    "transaction {} is not active",
                    transaction.id()
                ))
            })?;

        let indexes = self.store.indexes.clone();
        self.store.write(|sets| -> Result<()> {
            // Another session may have committed a clashing row since the
            // transaction last wrote.
            for index in indexes.iter() {
                if let Some(overlay_rows) = overlay.get(index.set) {
                    let mut rows = MemoryStore::rows_of(sets, index.set);
                    apply_overlay(&mut rows, overlay_rows);
                    ensure_distinct(index, &rows)?;
                }
            }
            for (set, overlay_rows) in &overlay {
                apply_overlay(sets.entry(*set).or_default(), overlay_rows);
            }
            Ok(())
        })
    }

    async fn rollback(&self, transaction: &Transaction) -> Result<()> {
        lock(&self.transactions).remove(&transaction.id());
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
        lock(&self.transactions).clear();
    }
}

/// Opens sessions over one shared [`MemoryStore`].
#[derive(Clone, Default)]
pub struct MemorySessionFactory {
    store: MemoryStore,
}

impl MemorySessionFactory {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn open(&self) -> Result<Session> {
        Ok(Session::new(Box::new(MemoryBackend::new(self.store.clone()))))
    }
}

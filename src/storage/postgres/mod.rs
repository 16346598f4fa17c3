//! PostgreSQL storage implementation
//!
//! Entities are stored as JSONB documents in a single `entities` table keyed
//! by `(entity_set, entity_key)`. Each session backend borrows connections
//! from a shared pool and keeps its explicit transactions open until they are
//! committed, rolled back or the session is released.

use crate::errors::{Result, StorageError};
use crate::storage::entity::EntityState;
use crate::storage::session::{Session, SessionBackend, SessionFactory, Transaction};
use crate::storage::tracker::PendingChange;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, Postgres};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

type PgTransaction = sqlx::Transaction<'static, Postgres>;

fn database_error(context: &str, error: sqlx::Error) -> StorageError {
    match &error {
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            StorageError::ConstraintViolation(format!("{}: {}", context, db_error))
        }
        _ => StorageError::DatabaseError(format!("{}: {}", context, error)),
    }
}

async fn load_set(conn: &mut PgConnection, set: &str) -> Result<Vec<(String, Value)>> {
    let rows = sqlx::query(
        "SELECT entity_key, body FROM entities WHERE entity_set = $1 ORDER BY entity_key",
    )
    .bind(set)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| database_error("Failed to load entity set", e))?;

    rows.iter()
        .map(|row| {
            let key: String = row.try_get("entity_key").map_err(|e| {
                StorageError::QueryFailed(format!("Failed to get entity_key: {}", e))
            })?;
            let body: Value = row
                .try_get("body")
                .map_err(|e| StorageError::QueryFailed(format!("Failed to get body: {}", e)))?;
            Ok((key, body))
        })
        .collect()
}

async fn load(conn: &mut PgConnection, set: &str, key: &str) -> Result<Option<Value>> {
    let row = sqlx::query("SELECT body FROM entities WHERE entity_set = $1 AND entity_key = $2")
        .bind(set)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| database_error("Failed to load entity", e))?;

    row.map(|row| {
        row.try_get("body")
            .map_err(|e| StorageError::QueryFailed(format!("Failed to get body: {}", e)))
    })
    .transpose()
}

async fn apply(conn: &mut PgConnection, change: &PendingChange) -> Result<()> {
    match change.state {
        EntityState::Added => {
            sqlx::query(
                r#"
                INSERT INTO entities (entity_set, entity_key, body, created_at, updated_at)
                VALUES ($1, $2, $3, NOW(), NOW())
                "#,
            )
            .bind(change.set)
            .bind(&change.key)
            .bind(&change.value)
            .execute(&mut *conn)
            .await
            .map_err(|e| database_error("Failed to insert entity", e))?;
        }
        EntityState::Modified => {
            let result = sqlx::query(
                r#"
                UPDATE entities SET body = $3, updated_at = NOW()
                WHERE entity_set = $1 AND entity_key = $2
                "#,
            )
            .bind(change.set)
            .bind(&change.key)
            .bind(&change.value)
            .execute(&mut *conn)
            .await
            .map_err(|e| database_error("Failed to update entity", e))?;

            if result.rows_affected() == 0 {
                return Err(StorageError::ConcurrencyConflict(format!(
                    "{} {} does not exist",
                    change.set, change.key
                )));
            }
        }
        EntityState::Deleted => {
            let result =
                sqlx::query("DELETE FROM entities WHERE entity_set = $1 AND entity_key = $2")
                    .bind(change.set)
                    .bind(&change.key)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| database_error("Failed to delete entity", e))?;

            if result.rows_affected() == 0 {
                return Err(StorageError::ConcurrencyConflict(format!(
                    "{} {} does not exist",
                    change.set, change.key
                )));
            }
        }
        EntityState::Unchanged | EntityState::Detached => {}
    }
    Ok(())
}

/// Session backend over a PostgreSQL pool
pub struct PostgresBackend {
    pool: PgPool,
    transactions: Mutex<HashMap<Uuid, PgTransaction>>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    fn inactive(transaction: &Transaction) -> StorageError {
        StorageError::TransactionFailed(format!("transaction {} is not active", transaction.id()))
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("PostgreSQL acquire failed: {}", e)))
    }
}

#[async_trait]
impl SessionBackend for PostgresBackend {
    async fn load_set(
        &self,
        set: &'static str,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<(String, Value)>> {
        match transaction {
            Some(transaction) => {
                let mut transactions = self.transactions.lock().await;
                let tx = transactions
                    .get_mut(&transaction.id())
                    .ok_or_else(|| Self::inactive(transaction))?;
                load_set(&mut **tx, set).await
            }
            None => {
                let mut conn = self.connection().await?;
                load_set(&mut *conn, set).await
            }
        }
    }

    async fn load(
        &self,
        set: &'static str,
        key: &str,
        transaction: Option<&Transaction>,
    ) -> Result<Option<Value>> {
        match transaction {
            Some(transaction) => {
                let mut transactions = self.transactions.lock().await;
                let tx = transactions
                    .get_mut(&transaction.id())
                    .ok_or_else(|| Self::inactive(transaction))?;
                load(&mut **tx, set, key).await
            }
            None => {
                let mut conn = self.connection().await?;
                load(&mut *conn, set, key).await
            }
        }
    }

    async fn write(
        &self,
        changes: &[PendingChange],
        transaction: Option<&Transaction>,
    ) -> Result<usize> {
        match transaction {
            Some(transaction) => {
                let mut transactions = self.transactions.lock().await;
                let tx = transactions
                    .get_mut(&transaction.id())
                    .ok_or_else(|| Self::inactive(transaction))?;
                for change in changes {
                    apply(&mut **tx, change).await?;
                }
            }
            None => {
                // Dropping the transaction on an early return rolls it back.
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| database_error("Failed to begin write transaction", e))?;
                for change in changes {
                    apply(&mut *tx, change).await?;
                }
                tx.commit()
                    .await
                    .map_err(|e| database_error("Failed to commit write transaction", e))?;
            }
        }
        Ok(changes.len())
    }

    async fn begin(&self) -> Result<Transaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionFailed(format!("begin failed: {}", e)))?;
        let transaction = Transaction::new();
        self.transactions.lock().await.insert(transaction.id(), tx);
        Ok(transaction)
    }

    async fn commit(&self, transaction: &Transaction) -> Result<()> {
        let tx = self
            .transactions
            .lock()
            .await
            .remove(&transaction.id())
            .ok_or_else(|| Self::inactive(transaction))?;
        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionFailed(format!("commit failed: {}", e)))
    }

    async fn rollback(&self, transaction: &Transaction) -> Result<()> {
        let tx = self.transactions.lock().await.remove(&transaction.id());
        match tx {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(|e| StorageError::TransactionFailed(format!("rollback failed: {}", e))),
            None => Ok(()),
        }
    }

    fn release(&self) {
        // sqlx rolls back transactions that are dropped unfinished.
        match self.transactions.try_lock() {
            Ok(mut transactions) => transactions.clear(),
            Err(_) => tracing::warn!("transactions busy during release; left to pool cleanup"),
        }
    }
}

/// Opens PostgreSQL-backed sessions from one shared pool
#[derive(Clone)]
pub struct PostgresSessionFactory {
    pool: PgPool,
}

impl PostgresSessionFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool with the given limits.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| {
                StorageError::ConnectionFailed(format!("PostgreSQL connection failed: {}", e))
            })?;
        Ok(Self::new(pool))
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(format!("Migration failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for PostgresSessionFactory {
    async fn open(&self) -> Result<Session> {
        Ok(Session::new(Box::new(PostgresBackend::new(self.pool.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_test_factory() -> PostgresSessionFactory {
        let database_url = std::env::var("DATABASE_URL").unwrap();
        let factory = PostgresSessionFactory::connect(&database_url, 2, Duration::from_secs(10))
            .await
            .unwrap();
        factory.migrate().await.unwrap();
        factory
    }

    fn change(set: &'static str, key: &str, state: EntityState, value: Value) -> PendingChange {
        PendingChange {
            set,
            key: key.to_string(),
            state,
            value,
            original: None,
        }
    }

    fn unique_key() -> String {
        Uuid::new_v4().to_string()
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_rollback_discards_transaction_writes() {
        let factory = setup_test_factory().await;
        let backend = PostgresBackend::new(factory.pool.clone());
        let key = unique_key();

        let transaction = backend.begin().await.unwrap();
        let added = change("scopes", &key, EntityState::Added, json!({ "name": key }));
        assert_eq!(backend.write(&[added], Some(&transaction)).await.unwrap(), 1);
        assert!(
            backend
                .load("scopes", &key, Some(&transaction))
                .await
                .unwrap()
                .is_some()
        );
        assert!(backend.load("scopes", &key, None).await.unwrap().is_none());

        backend.rollback(&transaction).await.unwrap();
        assert!(backend.load("scopes", &key, None).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_failed_write_leaves_nothing_behind() {
        let factory = setup_test_factory().await;
        let backend = PostgresBackend::new(factory.pool.clone());
        let first = unique_key();
        let second = unique_key();

        let seed = change("scopes", &first, EntityState::Added, json!({ "name": first }));
        backend.write(&[seed.clone()], None).await.unwrap();

        let batch = [
            change("scopes", &second, EntityState::Added, json!({ "name": second })),
            seed,
        ];
        let result = backend.write(&batch, None).await;
        assert!(matches!(result, Err(StorageError::ConstraintViolation(_))));
        assert!(backend.load("scopes", &second, None).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_duplicate_normalized_user_name_is_a_constraint_violation() {
        let factory = setup_test_factory().await;
        let backend = PostgresBackend::new(factory.pool.clone());
        let name = unique_key().to_uppercase();
        let user = |key: String| {
            change(
                "users",
                &key,
                EntityState::Added,
                json!({ "normalized_user_name": name, "normalized_email": null }),
            )
        };

        backend.write(&[user(unique_key())], None).await.unwrap();
        let result = backend.write(&[user(unique_key())], None).await;
        assert!(matches!(result, Err(StorageError::ConstraintViolation(_))));
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_missing_row_is_a_concurrency_conflict() {
        let factory = setup_test_factory().await;
        let backend = PostgresBackend::new(factory.pool.clone());
        let key = unique_key();

        for state in [EntityState::Modified, EntityState::Deleted] {
            let result = backend
                .write(&[change("scopes", &key, state, json!({ "name": key }))], None)
                .await;
            assert!(matches!(result, Err(StorageError::ConcurrencyConflict(_))));
        }
    }
}

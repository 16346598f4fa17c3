//! Data access: entities, sessions, repositories and the unit of work, with
//! in-memory and PostgreSQL backends.

pub mod entity;
pub mod history;
pub mod inmemory;
pub mod repository;
pub mod session;
pub mod tracker;
pub mod unit_of_work;

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-export commonly used types and traits
pub use entity::{Entity, EntityGraph, EntityState, GraphNode, UniqueIndex};
pub use history::ChangeHistory;
pub use inmemory::{MemorySessionFactory, MemoryStore};
pub use repository::{EntityRepository, Query, Repository};
pub use session::{Session, SessionFactory, SessionLease, Transaction, TransactionStatus};
pub use unit_of_work::{RegisteredEntity, SaveChangesResult, UnitOfWork, unique_indexes};

#[cfg(feature = "postgres")]
pub use postgres::PostgresSessionFactory;

use crate::errors::StorageError;
use std::sync::Arc;
use std::time::Duration;

/// Storage backend configuration and factory
#[derive(Clone, Debug, PartialEq)]
pub enum StorageBackend {
    Memory,
    #[cfg(feature = "postgres")]
    Postgres {
        database_url: String,
        max_connections: u32,
        acquire_timeout: Duration,
    },
}

/// Create a session factory for the configured backend. PostgreSQL
/// migrations run before the factory is returned.
pub async fn create_session_factory(
    backend: StorageBackend,
) -> std::result::Result<Arc<dyn SessionFactory>, StorageError> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemorySessionFactory::default())),
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres {
            database_url,
            max_connections,
            acquire_timeout,
        } => {
            let factory =
                PostgresSessionFactory::connect(&database_url, max_connections, acquire_timeout)
                    .await?;

            // Run migrations
            factory.migrate().await?;

            Ok(Arc::new(factory))
        }
    }
}

/// Parse storage backend from configuration string
#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
pub fn parse_storage_backend(
    backend_name: &str,
    database_url: Option<&str>,
    max_connections: u32,
    acquire_timeout: Duration,
) -> std::result::Result<StorageBackend, StorageError> {
    match backend_name {
        "memory" => Ok(StorageBackend::Memory),
        #[cfg(feature = "postgres")]
        "postgres" => {
            let url = database_url.ok_or_else(|| {
                StorageError::InvalidData("DATABASE_URL required for postgres backend".to_string())
            })?;
            Ok(StorageBackend::Postgres {
                database_url: url.to_string(),
                max_connections,
                acquire_timeout,
            })
        }
        _ => Err(StorageError::InvalidData(format!(
            "Unknown storage backend: {}",
            backend_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_backend() {
        let timeout = Duration::from_secs(10);
        assert_eq!(
            parse_storage_backend("memory", None, 10, timeout).unwrap(),
            StorageBackend::Memory
        );
        assert!(matches!(
            parse_storage_backend("redis", None, 10, timeout),
            Err(StorageError::InvalidData(_))
        ));
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_parse_postgres_requires_url() {
        let timeout = Duration::from_secs(10);
        assert!(parse_storage_backend("postgres", None, 10, timeout).is_err());
        assert!(matches!(
            parse_storage_backend("postgres", Some("postgres://localhost/auth"), 5, timeout),
            Ok(StorageBackend::Postgres { max_connections: 5, .. })
        ));
    }
}

//! Generic repository over one entity type within a session.

use crate::errors::Result;
use crate::storage::entity::{Entity, from_value, to_value};
use crate::storage::session::SessionLease;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Lazy read over an entity set.
///
/// Nothing touches the store until one of the fetch methods is awaited; the
/// read then runs against the session as it is at that moment, including its
/// live transaction and staged changes.
pub struct Query<E: Entity> {
    lease: Arc<SessionLease>,
    predicates: Vec<Predicate<E>>,
}

impl<E: Entity> Query<E> {
    pub fn new(lease: Arc<SessionLease>) -> Self {
        Self {
            lease,
            predicates: Vec::new(),
        }
    }

    /// Keep only entities matching `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    pub async fn fetch_all(self) -> Result<Vec<E>> {
        let session = self.lease.session()?;
        let rows = session.query(E::SET).await?;

        let mut entities = Vec::with_capacity(rows.len());
        for value in rows {
            let entity = from_value::<E>(value)?;
            if self.predicates.iter().all(|predicate| predicate(&entity)) {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    pub async fn fetch_optional(self) -> Result<Option<E>> {
        Ok(self.fetch_all().await?.into_iter().next())
    }

    pub async fn exists(self) -> Result<bool> {
        Ok(self.fetch_optional().await?.is_some())
    }

    pub async fn count(self) -> Result<usize> {
        Ok(self.fetch_all().await?.len())
    }
}

/// Read/write accessor for entity type `E`.
///
/// Mutations are staged in the session and written when the owning unit of
/// work commits.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// Unfiltered lazy read of every `E`. Entities inserted but not yet
    /// committed are included.
    fn get_all(&self) -> Query<E>;

    async fn find(&self, key: &str) -> Result<Option<E>>;

    fn insert(&self, entity: &E) -> Result<()>;

    fn update(&self, entity: &E) -> Result<()>;

    fn delete(&self, entity: &E) -> Result<()>;

    /// Load the entity and stage its deletion. Returns `false` when no
    /// entity has the key.
    async fn delete_by_key(&self, key: &str) -> Result<bool> {
        match self.find(key).await? {
            Some(entity) => {
                self.delete(&entity)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self) -> Result<usize> {
        self.get_all().count().await
    }
}

/// The repository a unit of work hands out when no custom one is registered.
pub struct EntityRepository<E: Entity> {
    lease: Arc<SessionLease>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EntityRepository<E> {
    pub fn new(lease: Arc<SessionLease>) -> Self {
        Self {
            lease,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for EntityRepository<E> {
    fn get_all(&self) -> Query<E> {
        Query::new(self.lease.clone())
    }

    async fn find(&self, key: &str) -> Result<Option<E>> {
        let session = self.lease.session()?;
        session
            .find(E::SET, key)
            .await?
            .map(from_value::<E>)
            .transpose()
    }

    fn insert(&self, entity: &E) -> Result<()> {
        let session = self.lease.session()?;
        session.add(E::SET, entity.key(), to_value(entity)?)
    }

    fn update(&self, entity: &E) -> Result<()> {
        let session = self.lease.session()?;
        session.update(E::SET, entity.key(), to_value(entity)?)
    }

    fn delete(&self, entity: &E) -> Result<()> {
        let session = self.lease.session()?;
        session.remove(E::SET, entity.key(), to_value(entity)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::storage::entity::EntityState;
    use crate::storage::inmemory::MemorySessionFactory;
    use crate::storage::session::SessionFactory;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
        size: u32,
    }

    impl Entity for Widget {
        const SET: &'static str = "widgets";

        fn key(&self) -> String {
            self.name.clone()
        }
    }

    fn widget(name: &str, size: u32) -> Widget {
        Widget {
            name: name.to_string(),
            size,
        }
    }

    async fn lease(factory: &MemorySessionFactory) -> Arc<SessionLease> {
        Arc::new(SessionLease::new(factory.open().await.unwrap()))
    }

    #[tokio::test]
    async fn test_get_all_reads_session_state_when_awaited() {
        let factory = MemorySessionFactory::default();
        let lease = lease(&factory).await;
        let repository = EntityRepository::<Widget>::new(lease.clone());

        let query = repository.get_all();
        repository.insert(&widget("a", 1)).unwrap();
        lease.session().unwrap().save_changes().await.unwrap();

        let widgets = query.fetch_all().await.unwrap();
        assert_eq!(widgets, vec![widget("a", 1)]);
    }

    #[tokio::test]
    async fn test_staged_insert_is_not_written_before_commit() {
        let factory = MemorySessionFactory::default();
        let lease = lease(&factory).await;
        let repository = EntityRepository::<Widget>::new(lease.clone());

        repository.insert(&widget("a", 1)).unwrap();
        assert!(!factory.store().contains("widgets", "a"));

        assert_eq!(lease.session().unwrap().save_changes().await.unwrap(), 1);
        assert!(factory.store().contains("widgets", "a"));
    }

    #[tokio::test]
    async fn test_staged_insert_is_visible_to_reads() {
        let factory = MemorySessionFactory::default();
        let lease = lease(&factory).await;
        let repository = EntityRepository::<Widget>::new(lease.clone());
        repository.insert(&widget("a", 1)).unwrap();
        lease.session().unwrap().save_changes().await.unwrap();

        repository.insert(&widget("b", 2)).unwrap();
        assert_eq!(
            repository.get_all().fetch_all().await.unwrap(),
            vec![widget("a", 1), widget("b", 2)]
        );
        assert_eq!(repository.find("b").await.unwrap(), Some(widget("b", 2)));

        // A staged insert that was deleted again is gone.
        repository.delete(&widget("b", 2)).unwrap();
        assert_eq!(repository.count().await.unwrap(), 1);
        assert_eq!(repository.find("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_filter_and_tracked_values() {
        let factory = MemorySessionFactory::default();
        let lease = lease(&factory).await;
        let repository = EntityRepository::<Widget>::new(lease.clone());
        repository.insert(&widget("a", 1)).unwrap();
        repository.insert(&widget("b", 5)).unwrap();
        lease.session().unwrap().save_changes().await.unwrap();

        // A staged update is what later reads observe.
        repository.update(&widget("a", 9)).unwrap();

        let large = repository
            .get_all()
            .filter(|widget| widget.size > 4)
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(large, vec![widget("a", 9), widget("b", 5)]);
        assert_eq!(
            lease.session().unwrap().state_of("widgets", "a"),
            EntityState::Modified
        );
    }

    #[tokio::test]
    async fn test_delete_by_key() {
        let factory = MemorySessionFactory::default();
        let lease = lease(&factory).await;
        let repository = EntityRepository::<Widget>::new(lease.clone());
        repository.insert(&widget("a", 1)).unwrap();
        lease.session().unwrap().save_changes().await.unwrap();

        assert!(repository.delete_by_key("a").await.unwrap());
        assert!(!repository.delete_by_key("missing").await.unwrap());
        assert_eq!(repository.count().await.unwrap(), 0);

        lease.session().unwrap().save_changes().await.unwrap();
        assert!(!factory.store().contains("widgets", "a"));
    }

    #[tokio::test]
    async fn test_revoked_lease_fails_with_disposed() {
        let factory = MemorySessionFactory::default();
        let lease = lease(&factory).await;
        let repository = EntityRepository::<Widget>::new(lease.clone());
        lease.revoke();

        assert_eq!(
            repository.insert(&widget("a", 1)),
            Err(StorageError::Disposed)
        );
        assert!(matches!(
            repository.get_all().fetch_all().await,
            Err(StorageError::Disposed)
        ));
    }
}

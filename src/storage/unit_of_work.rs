//! Unit of work over one session.
//!
//! A [`UnitOfWork`] owns one [`Session`] for the lifetime of a logical
//! operation. Every repository and identity manager it hands out works through
//! that session, so all of them share one change tracker and one transaction.
//!
//! Commit failures do not propagate. [`UnitOfWork::save_changes`] records them
//! as a [`SaveChangesResult`] and returns `Ok(0)`, which lets batch callers
//! such as seeding carry on past one bad record and inspect the outcome
//! afterwards. Only [`StorageError::Disposed`] is returned as an error.

use crate::errors::{Result, StorageError};
use crate::identity::models::{ApplicationRole, ApplicationUser, UserRole};
use crate::identity::password::PasswordHasher;
use crate::identity::role_manager::RoleManager;
use crate::identity::user_manager::UserManager;
use crate::oauth::types::{Application, Scope};
use crate::storage::entity::{Entity, EntityGraph, EntityState, GraphNode, UniqueIndex};
use crate::storage::history::{ChangeHistory, history_rows};
use crate::storage::repository::{EntityRepository, Repository};
use crate::storage::session::{Session, SessionFactory, SessionLease, Transaction, lock};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of the most recent commit attempt of a unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaveChangesResult {
    /// No commit has been attempted yet
    #[default]
    NotAttempted,
    /// The commit wrote this many entries
    Saved(usize),
    /// The commit failed and wrote nothing
    Failed(StorageError),
}

impl SaveChangesResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn error(&self) -> Option<&StorageError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

type RepositoryCell<E> = Mutex<Option<Arc<dyn Repository<E>>>>;

/// Cached repositories of one entity type
pub struct RepositorySlot<E: Entity> {
    generic: RepositoryCell<E>,
    custom: RepositoryCell<E>,
}

impl<E: Entity> Default for RepositorySlot<E> {
    fn default() -> Self {
        Self {
            generic: Mutex::new(None),
            custom: Mutex::new(None),
        }
    }
}

impl<E: Entity> RepositorySlot<E> {
    fn clear(&self) {
        lock(&self.generic).take();
        lock(&self.custom).take();
    }
}

/// One repository slot per entity type, resolved at compile time through
/// [`RegisteredEntity`].
#[derive(Default)]
pub struct RepositoryRegistry {
    applications: RepositorySlot<Application>,
    scopes: RepositorySlot<Scope>,
    users: RepositorySlot<ApplicationUser>,
    roles: RepositorySlot<ApplicationRole>,
    user_roles: RepositorySlot<UserRole>,
    change_history: RepositorySlot<ChangeHistory>,
}

impl RepositoryRegistry {
    fn clear(&self) {
        self.applications.clear();
        self.scopes.clear();
        self.users.clear();
        self.roles.clear();
        self.user_roles.clear();
        self.change_history.clear();
    }
}

/// Entity types a unit of work can hand out repositories for.
pub trait RegisteredEntity: Entity {
    fn slot(registry: &RepositoryRegistry) -> &RepositorySlot<Self>;
}

impl RegisteredEntity for Application {
    fn slot(registry: &RepositoryRegistry) -> &RepositorySlot<Self> {
        &registry.applications
    }
}

impl RegisteredEntity for Scope {
    fn slot(registry: &RepositoryRegistry) -> &RepositorySlot<Self> {
        &registry.scopes
    }
}

impl RegisteredEntity for ApplicationUser {
    fn slot(registry: &RepositoryRegistry) -> &RepositorySlot<Self> {
        &registry.users
    }
}

impl RegisteredEntity for ApplicationRole {
    fn slot(registry: &RepositoryRegistry) -> &RepositorySlot<Self> {
        &registry.roles
    }
}

impl RegisteredEntity for UserRole {
    fn slot(registry: &RepositoryRegistry) -> &RepositorySlot<Self> {
        &registry.user_roles
    }
}

impl RegisteredEntity for ChangeHistory {
    fn slot(registry: &RepositoryRegistry) -> &RepositorySlot<Self> {
        &registry.change_history
    }
}

/// Unique indexes declared by every registered entity type.
pub fn unique_indexes() -> Vec<UniqueIndex> {
    UniqueIndex::of::<Application>()
        .chain(UniqueIndex::of::<Scope>())
        .chain(UniqueIndex::of::<ApplicationUser>())
        .chain(UniqueIndex::of::<ApplicationRole>())
        .chain(UniqueIndex::of::<UserRole>())
        .chain(UniqueIndex::of::<ChangeHistory>())
        .collect()
}

pub struct UnitOfWork {
    id: Uuid,
    lease: Arc<SessionLease>,
    registry: RepositoryRegistry,
    users: UserManager,
    roles: RoleManager,
    last_result: Mutex<SaveChangesResult>,
    cancellation: CancellationToken,
}

impl UnitOfWork {
    pub fn new(session: Session, hasher: Arc<dyn PasswordHasher>) -> Self {
        let lease = Arc::new(SessionLease::new(session));
        Self {
            id: Uuid::new_v4(),
            users: UserManager::new(lease.clone(), hasher),
            roles: RoleManager::new(lease.clone()),
            lease,
            registry: RepositoryRegistry::default(),
            last_result: Mutex::new(SaveChangesResult::NotAttempted),
            cancellation: CancellationToken::new(),
        }
    }

    /// Open a fresh session from `factory` and wrap it.
    pub async fn open(
        factory: &dyn SessionFactory,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Result<Self> {
        let session = factory.open().await?;
        Ok(Self::new(session, hasher))
    }

    /// Abandon commits once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn session(&self) -> Result<&Session> {
        self.lease.session()
    }

    /// Repository for `E`. With `use_custom` set, a repository registered
    /// through [`register_repository`](Self::register_repository) wins;
    /// otherwise the cached generic repository is returned, created on first
    /// use.
    pub fn repository<E: RegisteredEntity>(&self, use_custom: bool) -> Result<Arc<dyn Repository<E>>> {
        self.session()?;
        let slot = E::slot(&self.registry);

        if use_custom {
            if let Some(custom) = lock(&slot.custom).as_ref() {
                return Ok(custom.clone());
            }
        }

        let mut generic = lock(&slot.generic);
        let repository = generic.get_or_insert_with(|| {
            let repository: Arc<dyn Repository<E>> =
                Arc::new(EntityRepository::<E>::new(self.lease.clone()));
            repository
        });
        Ok(repository.clone())
    }

    /// Register a custom repository for `E`, built over this unit's session.
    pub fn register_repository<E, F>(&self, factory: F) -> Result<()>
    where
        E: RegisteredEntity,
        F: FnOnce(Arc<SessionLease>) -> Arc<dyn Repository<E>>,
    {
        self.session()?;
        let repository = factory(self.lease.clone());
        *lock(&E::slot(&self.registry).custom) = Some(repository);
        Ok(())
    }

    /// Commit staged changes. A failed commit is recorded in
    /// [`last_save_changes_result`](Self::last_save_changes_result) and
    /// reported as `Ok(0)`. With `ensure_history`, one [`ChangeHistory`] row
    /// per changed entity is written in the same commit and counted.
    ///
    /// Cancellation is observed once, before the write starts. A write that
    /// has started always runs to completion so the batch is never left half
    /// applied inside a live transaction.
    pub async fn save_changes(&self, ensure_history: bool) -> Result<usize> {
        let session = self.session()?;

        let attempt = if self.cancellation.is_cancelled() {
            Err(StorageError::Cancelled(format!(
                "commit of unit of work {} cancelled",
                self.id
            )))
        } else {
            commit(session, ensure_history).await
        };

        match attempt {
            Ok(count) => {
                tracing::debug!(unit_of_work = %self.id, session_id = %session.id(), count, "changes saved");
                *lock(&self.last_result) = SaveChangesResult::Saved(count);
                Ok(count)
            }
            Err(StorageError::Disposed) => Err(StorageError::Disposed),
            Err(error) => {
                tracing::warn!(unit_of_work = %self.id, session_id = %session.id(), error = %error, "save changes failed");
                *lock(&self.last_result) = SaveChangesResult::Failed(error);
                Ok(0)
            }
        }
    }

    /// Commit each peer in order, then this unit, and sum what was written.
    ///
    /// Peers commit independently: a peer's failure is recorded on that peer
    /// and the remaining commits still run. Nothing is committed when this
    /// unit or any peer is already disposed.
    pub async fn save_changes_with(
        &self,
        ensure_history: bool,
        peers: &[&UnitOfWork],
    ) -> Result<usize> {
        self.session()?;
        if peers.iter().any(|peer| peer.is_disposed()) {
            return Err(StorageError::Disposed);
        }

        let mut total = 0;
        for peer in peers {
            total += peer.save_changes(ensure_history).await?;
        }
        total += self.save_changes(ensure_history).await?;
        Ok(total)
    }

    /// Drop every staged change, e.g. after a failed commit that should not
    /// be retried by the next one.
    pub fn discard_changes(&self) -> Result<()> {
        self.session()?.discard_changes();
        Ok(())
    }

    /// Outcome of the most recent commit attempt. Readable after disposal.
    pub fn last_save_changes_result(&self) -> SaveChangesResult {
        lock(&self.last_result).clone()
    }

    /// Start a transaction. When one is live, `use_if_exists` returns it;
    /// otherwise it is rolled back and replaced.
    pub async fn begin_transaction(&self, use_if_exists: bool) -> Result<Transaction> {
        let session = self.session()?;
        if use_if_exists {
            if let Some(current) = session.current_transaction() {
                return Ok(current);
            }
        }
        session.begin_transaction().await
    }

    pub async fn commit_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.session()?.commit_transaction(transaction).await
    }

    pub async fn rollback_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.session()?.rollback_transaction(transaction).await
    }

    pub fn current_transaction(&self) -> Result<Option<Transaction>> {
        Ok(self.session()?.current_transaction())
    }

    /// Toggle change detection on update. Bulk loads turn it off and must
    /// turn it back on.
    pub fn set_auto_detect_changes(&self, value: bool) -> Result<()> {
        self.session()?.set_auto_detect_changes(value);
        Ok(())
    }

    pub fn auto_detect_changes(&self) -> Result<bool> {
        Ok(self.session()?.auto_detect_changes())
    }

    /// Attach a disconnected graph, with `classifier` choosing each node's
    /// state.
    pub fn track_graph<F>(&self, graph: &EntityGraph, classifier: F) -> Result<()>
    where
        F: FnMut(&GraphNode) -> EntityState,
    {
        self.session()?.track_graph(graph, classifier);
        Ok(())
    }

    /// State of the entity with `key` as tracked by this unit's session.
    pub fn entity_state<E: Entity>(&self, key: &str) -> Result<EntityState> {
        Ok(self.session()?.state_of(E::SET, key))
    }

    pub fn user_manager(&self) -> Result<&UserManager> {
        self.session()?;
        Ok(&self.users)
    }

    pub fn role_manager(&self) -> Result<&RoleManager> {
        self.session()?;
        Ok(&self.roles)
    }

    /// Release the session and clear the repository cache. Later calls are
    /// no-ops.
    pub fn dispose(&self) {
        if self.lease.revoke() {
            self.registry.clear();
            tracing::debug!(unit_of_work = %self.id, "unit of work disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lease.is_disposed()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn commit(session: &Session, ensure_history: bool) -> Result<usize> {
    if ensure_history {
        session.save_changes_audited(history_rows).await
    } else {
        session.save_changes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::password::Argon2PasswordHasher;
    use crate::storage::inmemory::{MemoryBackend, MemorySessionFactory, MemoryStore};
    use crate::storage::session::SessionBackend;
    use crate::storage::tracker::PendingChange;
    use async_trait::async_trait;
    use serde_json::Value;

    async fn unit_of_work(factory: &MemorySessionFactory) -> UnitOfWork {
        UnitOfWork::open(factory, Arc::new(Argon2PasswordHasher))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_repository_is_cached_per_entity_type() {
        let factory = MemorySessionFactory::default();
        let uow = unit_of_work(&factory).await;

        let first = uow.repository::<Scope>(false).unwrap();
        let second = uow.repository::<Scope>(false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Without a registered custom repository the generic one is used.
        let fallback = uow.repository::<Scope>(true).unwrap();
        assert!(Arc::ptr_eq(&first, &fallback));
    }

    #[tokio::test]
    async fn test_custom_repository_wins_only_when_requested() {
        let factory = MemorySessionFactory::default();
        let uow = unit_of_work(&factory).await;
        let generic = uow.repository::<Scope>(false).unwrap();

        uow.register_repository(|lease| {
            Arc::new(EntityRepository::<Scope>::new(lease)) as Arc<dyn Repository<Scope>>
        })
        .unwrap();

        let custom = uow.repository::<Scope>(true).unwrap();
        assert!(!Arc::ptr_eq(&generic, &custom));
        assert!(Arc::ptr_eq(&generic, &uow.repository::<Scope>(false).unwrap()));
    }

    #[tokio::test]
    async fn test_ensure_history_writes_history_rows() {
        let factory = MemorySessionFactory::default();
        let uow = unit_of_work(&factory).await;
        let scopes = uow.repository::<Scope>(false).unwrap();
        scopes.insert(&Scope::new("api1", "My API", &["resource_server_1"])).unwrap();

        assert_eq!(uow.save_changes(true).await.unwrap(), 2);
        assert_eq!(factory.store().count(ChangeHistory::SET), 1);
        assert_eq!(uow.last_save_changes_result(), SaveChangesResult::Saved(2));

        let history = uow
            .repository::<ChangeHistory>(false)
            .unwrap()
            .get_all()
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(history[0].entity_key, "api1");
        assert_eq!(history[0].state, EntityState::Added);
    }

    #[tokio::test]
    async fn test_cancelled_commit_is_captured() {
        let factory = MemorySessionFactory::default();
        let token = CancellationToken::new();
        let uow = unit_of_work(&factory).await.with_cancellation(token.clone());
        uow.repository::<Scope>(false)
            .unwrap()
            .insert(&Scope::new("api1", "My API", &[]))
            .unwrap();

        token.cancel();
        assert_eq!(uow.save_changes(false).await.unwrap(), 0);
        assert!(matches!(
            uow.last_save_changes_result(),
            SaveChangesResult::Failed(StorageError::Cancelled(_))
        ));
        assert_eq!(factory.store().count(Scope::SET), 0);
    }

    /// Backend that cancels the unit's token while a write is in flight.
    struct CancellingBackend {
        inner: MemoryBackend,
        token: CancellationToken,
    }

    #[async_trait]
    impl SessionBackend for CancellingBackend {
        async fn load_set(
            &self,
            set: &'static str,
            transaction: Option<&Transaction>,
        ) -> Result<Vec<(String, Value)>> {
            self.inner.load_set(set, transaction).await
        }

        async fn load(
            &self,
            set: &'static str,
            key: &str,
            transaction: Option<&Transaction>,
        ) -> Result<Option<Value>> {
            self.inner.load(set, key, transaction).await
        }

        async fn write(
            &self,
            changes: &[PendingChange],
            transaction: Option<&Transaction>,
        ) -> Result<usize> {
            self.token.cancel();
            tokio::task::yield_now().await;
            self.inner.write(changes, transaction).await
        }

        async fn begin(&self) -> Result<Transaction> {
            self.inner.begin().await
        }

        async fn commit(&self, transaction: &Transaction) -> Result<()> {
            self.inner.commit(transaction).await
        }

        async fn rollback(&self, transaction: &Transaction) -> Result<()> {
            self.inner.rollback(transaction).await
        }

        fn release(&self) {
            self.inner.release()
        }
    }

    #[tokio::test]
    async fn test_cancel_during_write_completes_the_batch() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let backend = CancellingBackend {
            inner: MemoryBackend::new(store.clone()),
            token: token.clone(),
        };
        let uow = UnitOfWork::new(
            Session::new(Box::new(backend)),
            Arc::new(Argon2PasswordHasher),
        )
        .with_cancellation(token.clone());

        let transaction = uow.begin_transaction(false).await.unwrap();
        let scopes = uow.repository::<Scope>(false).unwrap();
        for name in ["api1", "api2", "api3"] {
            scopes.insert(&Scope::new(name, name, &[])).unwrap();
        }

        assert_eq!(uow.save_changes(false).await.unwrap(), 3);
        assert_eq!(uow.last_save_changes_result(), SaveChangesResult::Saved(3));
        assert!(token.is_cancelled());
        assert_eq!(uow.entity_state::<Scope>("api2").unwrap(), EntityState::Unchanged);

        uow.commit_transaction(&transaction).await.unwrap();
        assert_eq!(store.count(Scope::SET), 3);

        // The next commit sees the cancellation before writing anything.
        scopes.insert(&Scope::new("api4", "api4", &[])).unwrap();
        assert_eq!(uow.save_changes(false).await.unwrap(), 0);
        assert!(matches!(
            uow.last_save_changes_result(),
            SaveChangesResult::Failed(StorageError::Cancelled(_))
        ));
        assert_eq!(store.count(Scope::SET), 3);
    }

    #[tokio::test]
    async fn test_auto_detect_changes_toggle() {
        let factory = MemorySessionFactory::default();
        let uow = unit_of_work(&factory).await;
        let scopes = uow.repository::<Scope>(false).unwrap();
        let scope = Scope::new("api1", "My API", &[]);
        scopes.insert(&scope).unwrap();
        uow.save_changes(false).await.unwrap();

        scopes.update(&scope).unwrap();
        assert_eq!(uow.entity_state::<Scope>("api1").unwrap(), EntityState::Unchanged);
        assert_eq!(uow.save_changes(false).await.unwrap(), 0);

        uow.set_auto_detect_changes(false).unwrap();
        assert!(!uow.auto_detect_changes().unwrap());
        scopes.update(&scope).unwrap();
        assert_eq!(uow.entity_state::<Scope>("api1").unwrap(), EntityState::Modified);
        assert_eq!(uow.save_changes(false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_track_graph_applies_classifier() {
        let factory = MemorySessionFactory::default();
        let uow = unit_of_work(&factory).await;

        let user = ApplicationUser::new("admin", None);
        let role = ApplicationRole::new("Manager");
        let link = UserRole {
            user_id: user.id,
            role_id: role.id,
        };
        let graph = EntityGraph::new(&user)
            .unwrap()
            .with(&link)
            .unwrap()
            .with(&role)
            .unwrap();

        uow.track_graph(&graph, |node| {
            if node.is::<ApplicationRole>() {
                EntityState::Detached
            } else {
                EntityState::Added
            }
        })
        .unwrap();

        assert_eq!(uow.entity_state::<ApplicationUser>(&user.key()).unwrap(), EntityState::Added);
        assert_eq!(uow.entity_state::<ApplicationRole>(&role.key()).unwrap(), EntityState::Detached);
        assert_eq!(uow.save_changes(false).await.unwrap(), 2);
        assert!(factory.store().contains(UserRole::SET, &link.key()));
    }

    #[tokio::test]
    async fn test_dispose_releases_live_transaction() {
        let factory = MemorySessionFactory::default();
        let uow = unit_of_work(&factory).await;
        let transaction = uow.begin_transaction(false).await.unwrap();
        uow.repository::<Scope>(false)
            .unwrap()
            .insert(&Scope::new("api1", "My API", &[]))
            .unwrap();
        uow.save_changes(false).await.unwrap();

        uow.dispose();
        assert!(!transaction.is_active());
        assert_eq!(factory.store().count(Scope::SET), 0);
    }
}

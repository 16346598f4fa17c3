//! Role management bound to a unit of work's session.

use crate::errors::IdentityError;
use crate::identity::models::{ApplicationRole, UserRole, normalize_key};
use crate::storage::repository::{EntityRepository, Repository};
use crate::storage::session::SessionLease;
use std::sync::Arc;
use uuid::Uuid;

/// Creates, finds and deletes roles. Changes are staged until the owning unit
/// of work commits.
pub struct RoleManager {
    roles: EntityRepository<ApplicationRole>,
    user_roles: EntityRepository<UserRole>,
}

impl RoleManager {
    pub fn new(lease: Arc<SessionLease>) -> Self {
        Self {
            roles: EntityRepository::new(lease.clone()),
            user_roles: EntityRepository::new(lease),
        }
    }

    pub async fn create(&self, role: &ApplicationRole) -> Result<(), IdentityError> {
        if role.name.trim().is_empty() {
            return Err(IdentityError::InvalidRoleName(role.name.clone()));
        }
        if self.find_by_name(&role.name).await?.is_some() {
            return Err(IdentityError::DuplicateRoleName(role.name.clone()));
        }

        let mut role = role.clone();
        role.normalized_name = normalize_key(&role.name);
        self.roles.insert(&role)?;
        tracing::debug!(role = %role.name, "role staged");
        Ok(())
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<ApplicationRole>, IdentityError> {
        let normalized = normalize_key(name);
        Ok(self
            .roles
            .get_all()
            .filter(move |role| role.normalized_name == normalized)
            .fetch_optional()
            .await?)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ApplicationRole>, IdentityError> {
        Ok(self.roles.find(&id.to_string()).await?)
    }

    pub async fn role_exists(&self, name: &str) -> Result<bool, IdentityError> {
        Ok(self.find_by_name(name).await?.is_some())
    }

    /// Delete a role together with its memberships.
    pub async fn delete(&self, role: &ApplicationRole) -> Result<(), IdentityError> {
        let role_id = role.id;
        let links = self
            .user_roles
            .get_all()
            .filter(move |link| link.role_id == role_id)
            .fetch_all()
            .await?;
        for link in &links {
            self.user_roles.delete(link)?;
        }
        self.roles.delete(role)?;
        Ok(())
    }

    pub async fn roles(&self) -> Result<Vec<ApplicationRole>, IdentityError> {
        Ok(self.roles.get_all().fetch_all().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::inmemory::MemorySessionFactory;
    use crate::storage::session::SessionFactory;

    async fn manager() -> (RoleManager, Arc<SessionLease>) {
        let factory = MemorySessionFactory::default();
        let lease = Arc::new(SessionLease::new(factory.open().await.unwrap()));
        (RoleManager::new(lease.clone()), lease)
    }

    #[tokio::test]
    async fn test_create_and_find_by_name() {
        let (manager, lease) = manager().await;
        manager.create(&ApplicationRole::new("Manager")).await.unwrap();
        lease.session().unwrap().save_changes().await.unwrap();

        let found = manager.find_by_name("manager").await.unwrap().unwrap();
        assert_eq!(found.name, "Manager");
        assert!(manager.role_exists("MANAGER").await.unwrap());
        assert_eq!(
            manager.find_by_id(found.id).await.unwrap().map(|role| role.name),
            Some("Manager".to_string())
        );
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_blank_names() {
        let (manager, lease) = manager().await;
        manager.create(&ApplicationRole::new("Manager")).await.unwrap();
        lease.session().unwrap().save_changes().await.unwrap();

        assert!(matches!(
            manager.create(&ApplicationRole::new("MANAGER")).await,
            Err(IdentityError::DuplicateRoleName(_))
        ));
        assert!(matches!(
            manager.create(&ApplicationRole::new("  ")).await,
            Err(IdentityError::InvalidRoleName(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_memberships() {
        let (manager, lease) = manager().await;
        let role = ApplicationRole::new("Manager");
        manager.create(&role).await.unwrap();
        let link = UserRole {
            user_id: Uuid::new_v4(),
            role_id: role.id,
        };
        manager.user_roles.insert(&link).unwrap();
        lease.session().unwrap().save_changes().await.unwrap();

        manager.delete(&role).await.unwrap();
        assert_eq!(lease.session().unwrap().save_changes().await.unwrap(), 2);
        assert!(manager.roles().await.unwrap().is_empty());
    }
}

//! User management bound to a unit of work's session.

use crate::errors::IdentityError;
use crate::identity::models::{ApplicationRole, ApplicationUser, UserRole, new_stamp, normalize_key};
use crate::identity::password::{PasswordHasher, PasswordPolicy};
use crate::identity::role_manager::RoleManager;
use crate::storage::entity::Entity;
use crate::storage::repository::{EntityRepository, Repository};
use crate::storage::session::SessionLease;
use std::sync::Arc;
use uuid::Uuid;

const ALLOWED_USER_NAME_CHARACTERS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._@+";

/// Creates users, checks passwords and manages role membership. Changes are
/// staged until the owning unit of work commits.
pub struct UserManager {
    users: EntityRepository<ApplicationUser>,
    user_roles: EntityRepository<UserRole>,
    roles: RoleManager,
    hasher: Arc<dyn PasswordHasher>,
    policy: PasswordPolicy,
}

impl UserManager {
    pub fn new(lease: Arc<SessionLease>, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self {
            users: EntityRepository::new(lease.clone()),
            user_roles: EntityRepository::new(lease.clone()),
            roles: RoleManager::new(lease),
            hasher,
            policy: PasswordPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PasswordPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate and stage a new user with a hashed password. Returns the user
    /// as staged.
    pub async fn create(
        &self,
        user: ApplicationUser,
        password: &str,
    ) -> Result<ApplicationUser, IdentityError> {
        let mut user = user;
        self.validate_user(&user).await?;
        self.policy.validate(password)?;

        user.normalized_user_name = normalize_key(&user.user_name);
        user.normalized_email = user.email.as_deref().map(normalize_key);
        user.password_hash = Some(self.hasher.hash_password(password)?);
        user.security_stamp = new_stamp();

        self.users.insert(&user)?;
        tracing::debug!(user_id = %user.id, user_name = %user.user_name, "user staged");
        Ok(user)
    }

    async fn validate_user(&self, user: &ApplicationUser) -> Result<(), IdentityError> {
        if user.user_name.is_empty()
            || !user
                .user_name
                .chars()
                .all(|c| ALLOWED_USER_NAME_CHARACTERS.contains(c))
        {
            return Err(IdentityError::InvalidUserName(user.user_name.clone()));
        }
        if self.find_by_name(&user.user_name).await?.is_some() {
            return Err(IdentityError::DuplicateUserName(user.user_name.clone()));
        }
        if let Some(email) = &user.email {
            if self.find_by_email(email).await?.is_some() {
                return Err(IdentityError::DuplicateEmail(email.clone()));
            }
        }
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ApplicationUser>, IdentityError> {
        Ok(self.users.find(&id.to_string()).await?)
    }

    pub async fn find_by_name(
        &self,
        user_name: &str,
    ) -> Result<Option<ApplicationUser>, IdentityError> {
        let normalized = normalize_key(user_name);
        Ok(self
            .users
            .get_all()
            .filter(move |user| user.normalized_user_name == normalized)
            .fetch_optional()
            .await?)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<ApplicationUser>, IdentityError> {
        let normalized = normalize_key(email);
        Ok(self
            .users
            .get_all()
            .filter(move |user| user.normalized_email.as_deref() == Some(normalized.as_str()))
            .fetch_optional()
            .await?)
    }

    pub async fn users(&self) -> Result<Vec<ApplicationUser>, IdentityError> {
        Ok(self.users.get_all().fetch_all().await?)
    }

    async fn require_role(&self, role_name: &str) -> Result<ApplicationRole, IdentityError> {
        self.roles
            .find_by_name(role_name)
            .await?
            .ok_or_else(|| IdentityError::RoleNotFound(role_name.to_string()))
    }

    pub async fn add_to_role(
        &self,
        user: &ApplicationUser,
        role_name: &str,
    ) -> Result<(), IdentityError> {
        let role = self.require_role(role_name).await?;
        let link = UserRole {
            user_id: user.id,
            role_id: role.id,
        };
        if self.user_roles.find(&link.key()).await?.is_some() {
            return Err(IdentityError::UserAlreadyInRole(role.name));
        }
        self.user_roles.insert(&link)?;
        Ok(())
    }

    pub async fn remove_from_role(
        &self,
        user: &ApplicationUser,
        role_name: &str,
    ) -> Result<(), IdentityError> {
        let role = self.require_role(role_name).await?;
        let link = UserRole {
            user_id: user.id,
            role_id: role.id,
        };
        if !self.user_roles.delete_by_key(&link.key()).await? {
            return Err(IdentityError::UserNotInRole(role.name));
        }
        Ok(())
    }

    pub async fn is_in_role(
        &self,
        user: &ApplicationUser,
        role_name: &str,
    ) -> Result<bool, IdentityError> {
        let Some(role) = self.roles.find_by_name(role_name).await? else {
            return Ok(false);
        };
        let link = UserRole {
            user_id: user.id,
            role_id: role.id,
        };
        Ok(self.user_roles.find(&link.key()).await?.is_some())
    }

    /// Names of the roles the user belongs to.
    pub async fn roles_of(&self, user: &ApplicationUser) -> Result<Vec<String>, IdentityError> {
        let user_id = user.id;
        let links = self
            .user_roles
            .get_all()
            .filter(move |link| link.user_id == user_id)
            .fetch_all()
            .await?;

        let mut names = Vec::with_capacity(links.len());
        for link in links {
            if let Some(role) = self.roles.find_by_id(link.role_id).await? {
                names.push(role.name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn check_password(
        &self,
        user: &ApplicationUser,
        password: &str,
    ) -> Result<bool, IdentityError> {
        match &user.password_hash {
            Some(hash) => self.hasher.verify_password(hash, password),
            None => Ok(false),
        }
    }

    /// Rotate the security stamp, invalidating tokens that carry the old one.
    pub fn update_security_stamp(
        &self,
        user: &ApplicationUser,
    ) -> Result<ApplicationUser, IdentityError> {
        let mut user = user.clone();
        user.security_stamp = new_stamp();
        user.concurrency_stamp = new_stamp();
        self.users.update(&user)?;
        Ok(user)
    }
}

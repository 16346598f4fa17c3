//! Identity entities: users, roles and their membership links.

use crate::storage::entity::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalize a user name, email or role name for lookups.
pub fn normalize_key(value: &str) -> String {
    value.trim().to_uppercase()
}

/// A user account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUser {
    pub id: Uuid,
    pub user_name: String,
    pub normalized_user_name: String,
    pub email: Option<String>,
    pub normalized_email: Option<String>,
    pub email_confirmed: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// PHC-format password hash, absent for accounts without a password
    pub password_hash: Option<String>,
    /// Changes whenever credentials change; tokens carry it to detect staleness
    pub security_stamp: String,
    pub concurrency_stamp: String,
    pub created_at: DateTime<Utc>,
}

impl ApplicationUser {
    pub fn new(user_name: &str, email: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_name: user_name.to_string(),
            normalized_user_name: normalize_key(user_name),
            email: email.map(str::to_string),
            normalized_email: email.map(normalize_key),
            email_confirmed: false,
            first_name: None,
            last_name: None,
            password_hash: None,
            security_stamp: new_stamp(),
            concurrency_stamp: new_stamp(),
            created_at: Utc::now(),
        }
    }

    pub fn with_names(mut self, first_name: Option<&str>, last_name: Option<&str>) -> Self {
        self.first_name = first_name.map(str::to_string);
        self.last_name = last_name.map(str::to_string);
        self
    }
}

impl Entity for ApplicationUser {
    const SET: &'static str = "users";
    const UNIQUE_FIELDS: &'static [&'static str] = &["normalized_user_name", "normalized_email"];

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A named role users can be members of
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRole {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub concurrency_stamp: String,
}

impl ApplicationRole {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            normalized_name: normalize_key(name),
            concurrency_stamp: new_stamp(),
        }
    }
}

impl Entity for ApplicationRole {
    const SET: &'static str = "roles";
    const UNIQUE_FIELDS: &'static [&'static str] = &["normalized_name"];

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Membership of one user in one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
}

impl Entity for UserRole {
    const SET: &'static str = "user_roles";

    fn key(&self) -> String {
        format!("{}:{}", self.user_id, self.role_id)
    }
}

pub(crate) fn new_stamp() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

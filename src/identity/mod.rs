//! Identity accessors: users, roles and password hashing.
//!
//! The managers operate through the same session as the unit of work that
//! hands them out, so identity mutations commit together with repository
//! mutations.

pub mod models;
pub mod password;
pub mod role_manager;
pub mod user_manager;

pub use models::{ApplicationRole, ApplicationUser, UserRole, normalize_key};
pub use password::{Argon2PasswordHasher, PasswordHasher, PasswordPolicy};
pub use role_manager::RoleManager;
pub use user_manager::UserManager;

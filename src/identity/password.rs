//! Password policy and the hashing primitive boundary.

use crate::errors::IdentityError;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString, rand_core::OsRng},
};

/// Hashes and verifies secrets. Implementations wrap an external primitive.
pub trait PasswordHasher: Send + Sync {
    fn hash_password(&self, password: &str) -> Result<String, IdentityError>;

    fn verify_password(&self, hash: &str, password: &str) -> Result<bool, IdentityError>;
}

/// Argon2id with the crate's default parameters, PHC string output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2PasswordHasher;

impl PasswordHasher for Argon2PasswordHasher {
    fn hash_password(&self, password: &str) -> Result<String, IdentityError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| IdentityError::PasswordHashingFailed(e.to_string()))?;
        Ok(hash.to_string())
    }

    fn verify_password(&self, hash: &str, password: &str) -> Result<bool, IdentityError> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| IdentityError::PasswordHashingFailed(format!("Invalid hash: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

/// Requirements a new password must satisfy
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub required_length: usize,
    pub require_digit: bool,
    pub require_lowercase: bool,
    pub require_uppercase: bool,
    pub require_non_alphanumeric: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            required_length: 6,
            require_digit: true,
            require_lowercase: true,
            require_uppercase: true,
            require_non_alphanumeric: true,
        }
    }
}

impl PasswordPolicy {
    /// Check a password, reporting every unmet requirement.
    pub fn validate(&self, password: &str) -> Result<(), IdentityError> {
        let mut failures = Vec::new();

        if password.chars().count() < self.required_length {
            failures.push(format!(
                "must be at least {} characters",
                self.required_length
            ));
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            failures.push("must contain a digit".to_string());
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            failures.push("must contain a lowercase letter".to_string());
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            failures.push("must contain an uppercase letter".to_string());
        }
        if self.require_non_alphanumeric && password.chars().all(|c| c.is_alphanumeric()) {
            failures.push("must contain a non-alphanumeric character".to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(IdentityError::PasswordRejected(failures.join(", ")))
        }
    }
}

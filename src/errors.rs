//! Standardized error types following the `error-ppauth-<domain>-<number>` format.

use thiserror::Error;

/// Configuration errors that occur during application startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when a required environment variable is not set
    #[error("error-ppauth-config-1 {0} must be set")]
    EnvVarRequired(String),

    /// Error when version information is not available
    #[error("error-ppauth-config-2 One of GIT_HASH or CARGO_PKG_VERSION must be set")]
    VersionNotSet,

    /// Error when duration string cannot be parsed
    #[error("error-ppauth-config-3 Failed to parse duration '{0}': {1}")]
    DurationParsingFailed(String, String),

    /// Error when boolean string cannot be parsed
    #[error(
        "error-ppauth-config-4 Failed to parse boolean '{0}': expected true/false/1/0/yes/no/on/off"
    )]
    BoolParsingFailed(String),

    /// Error when an integer setting cannot be parsed
    #[error("error-ppauth-config-5 Failed to parse '{0}' as a number: {1:?}")]
    NumberParsingFailed(String, std::num::ParseIntError),

    /// Error when only one half of the administrator credentials is set
    #[error("error-ppauth-config-6 ADMIN_EMAIL and ADMIN_PASSWORD must be set together")]
    IncompleteAdminAccount,
}

/// OAuth token exchange errors
#[derive(Debug, Error)]
pub enum OAuthError {
    /// The client application referenced by the request does not exist
    #[error("error-ppauth-oauth-1 Application not found: {0}")]
    ApplicationNotFound(String),

    /// The grant type is not handled by this server
    #[error("error-ppauth-oauth-2 Grant type not implemented: {0}")]
    GrantTypeNotImplemented(String),

    /// Invalid request
    #[error("error-ppauth-oauth-3 Invalid request: {0}")]
    InvalidRequest(String),

    /// Server error
    #[error("error-ppauth-oauth-4 Server error: {0}")]
    ServerError(String),
}

/// Identity management errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// User name is empty or contains characters outside the allowed set
    #[error("error-ppauth-identity-1 Invalid user name: {0}")]
    InvalidUserName(String),

    /// Another user already has the normalized user name
    #[error("error-ppauth-identity-2 User name already taken: {0}")]
    DuplicateUserName(String),

    /// Another user already has the normalized email
    #[error("error-ppauth-identity-3 Email already taken: {0}")]
    DuplicateEmail(String),

    /// Role name is empty
    #[error("error-ppauth-identity-4 Invalid role name: {0}")]
    InvalidRoleName(String),

    /// Another role already has the normalized name
    #[error("error-ppauth-identity-5 Role name already taken: {0}")]
    DuplicateRoleName(String),

    /// Referenced role does not exist
    #[error("error-ppauth-identity-6 Role not found: {0}")]
    RoleNotFound(String),

    /// User is already a member of the role
    #[error("error-ppauth-identity-7 User already in role: {0}")]
    UserAlreadyInRole(String),

    /// User is not a member of the role
    #[error("error-ppauth-identity-8 User not in role: {0}")]
    UserNotInRole(String),

    /// Password does not satisfy the password policy
    #[error("error-ppauth-identity-9 Password rejected: {0}")]
    PasswordRejected(String),

    /// Password hashing primitive failed
    #[error("error-ppauth-identity-10 Password hashing failed: {0}")]
    PasswordHashingFailed(String),

    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Database/storage errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Error when database connection fails
    #[error("error-ppauth-storage-1 Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Error when query execution fails
    #[error("error-ppauth-storage-2 Query execution failed: {0}")]
    QueryFailed(String),

    /// Error when data serialization fails
    #[error("error-ppauth-storage-3 Data serialization failed: {0}")]
    SerializationFailed(String),

    /// Error when database operation fails
    #[error("error-ppauth-storage-4 Database error: {0}")]
    DatabaseError(String),

    /// Error when data validation fails
    #[error("error-ppauth-storage-5 Invalid data: {0}")]
    InvalidData(String),

    /// Error when an inserted key already exists
    #[error("error-ppauth-storage-6 Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Error when an updated or deleted row no longer exists
    #[error("error-ppauth-storage-7 Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Error when a transaction cannot be started, committed or rolled back
    #[error("error-ppauth-storage-8 Transaction failed: {0}")]
    TransactionFailed(String),

    /// Error when a commit observed cancellation
    #[error("error-ppauth-storage-9 Operation cancelled: {0}")]
    Cancelled(String),

    /// Error when a unit of work is used after disposal
    #[error("error-ppauth-storage-10 Unit of work disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, StorageError>;

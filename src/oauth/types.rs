//! OAuth core types: grant types, token requests, client applications and scopes.

use crate::storage::entity::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OAuth 2.0 grant types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    ClientCredentials,
    RefreshToken,
    Password,
    /// Any grant type this server has no handler for, e.g. custom grants
    #[serde(untagged)]
    Other(String),
}

impl GrantType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken => "refresh_token",
            Self::Password => "password",
            Self::Other(value) => value,
        }
    }
}

impl From<&str> for GrantType {
    fn from(value: &str) -> Self {
        match value {
            "authorization_code" => Self::AuthorizationCode,
            "client_credentials" => Self::ClientCredentials,
            "refresh_token" => Self::RefreshToken,
            "password" => Self::Password,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token request that the protocol engine has already validated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Grant type
    pub grant_type: GrantType,
    /// Client ID
    pub client_id: Option<String>,
    /// Requested scopes, in request order
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenRequest {
    pub fn client_credentials(client_id: &str, scopes: &[&str]) -> Self {
        Self {
            grant_type: GrantType::ClientCredentials,
            client_id: Some(client_id.to_string()),
            scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
        }
    }
}

/// Client Type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Public,
    Confidential,
}

/// Permission strings granted to client applications
pub mod permissions {
    pub const ENDPOINT_TOKEN: &str = "ept:token";
    pub const GRANT_TYPE_CLIENT_CREDENTIALS: &str = "gt:client_credentials";
    pub const GRANT_TYPE_PASSWORD: &str = "gt:password";
    pub const GRANT_TYPE_REFRESH_TOKEN: &str = "gt:refresh_token";
    pub const SCOPE_ADDRESS: &str = "scp:address";
    pub const SCOPE_EMAIL: &str = "scp:email";
    pub const SCOPE_PROFILE: &str = "scp:profile";
}

/// A registered OAuth client application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    /// Unique client identifier
    pub client_id: String,
    /// Hash of the client secret (absent for public clients)
    pub client_secret: Option<String>,
    /// Human readable name, used as the `name` claim of client tokens
    pub display_name: Option<String>,
    /// Client type (public or confidential)
    pub client_type: ClientType,
    /// Granted permissions
    pub permissions: Vec<String>,
    /// Redirect URIs
    pub redirect_uris: Vec<String>,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn new(client_id: &str, display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            client_id: client_id.to_string(),
            client_secret: None,
            display_name: Some(display_name.to_string()),
            client_type: ClientType::Public,
            permissions: Vec::new(),
            redirect_uris: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|granted| granted == permission)
    }
}

impl Entity for Application {
    const SET: &'static str = "applications";

    fn key(&self) -> String {
        self.client_id.clone()
    }
}

/// A scope and the resource servers it grants access to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    pub display_name: Option<String>,
    pub resources: Vec<String>,
}

impl Scope {
    pub fn new(name: &str, display_name: &str, resources: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            display_name: Some(display_name.to_string()),
            resources: resources.iter().map(|resource| resource.to_string()).collect(),
        }
    }
}

impl Entity for Scope {
    const SET: &'static str = "scopes";

    fn key(&self) -> String {
        self.name.clone()
    }
}

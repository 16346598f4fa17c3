//! Claims, claims identities and principals handed to the token signer.

use serde::{Deserialize, Serialize};

/// Standard claim types
pub mod claim_types {
    pub const SUBJECT: &str = "sub";
    pub const NAME: &str = "name";
    pub const PREFERRED_USERNAME: &str = "preferred_username";
    pub const EMAIL: &str = "email";
    pub const ROLE: &str = "role";
    /// Marker carried by identities built from user accounts; never emitted
    pub const SECURITY_STAMP: &str = "AspNet.Identity.SecurityStamp";
}

/// Standard scope names
pub mod scopes {
    pub const OPENID: &str = "openid";
    pub const PROFILE: &str = "profile";
    pub const EMAIL: &str = "email";
    pub const ROLES: &str = "roles";
    pub const OFFLINE_ACCESS: &str = "offline_access";
}

/// A token a claim may be emitted into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    AccessToken,
    IdentityToken,
}

/// The set of tokens a claim is emitted into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Destinations {
    pub access_token: bool,
    pub identity_token: bool,
}

impl Destinations {
    pub const NONE: Self = Self {
        access_token: false,
        identity_token: false,
    };

    pub fn contains(&self, destination: Destination) -> bool {
        match destination {
            Destination::AccessToken => self.access_token,
            Destination::IdentityToken => self.identity_token,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.access_token && !self.identity_token
    }

    /// Destinations in emission order: access token first.
    pub fn iter(&self) -> impl Iterator<Item = Destination> {
        [
            self.access_token.then_some(Destination::AccessToken),
            self.identity_token.then_some(Destination::IdentityToken),
        ]
        .into_iter()
        .flatten()
    }
}

impl Serialize for Destinations {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// A typed assertion about an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    #[serde(rename = "type")]
    pub claim_type: String,
    pub value: String,
    pub destinations: Destinations,
}

impl Claim {
    pub fn new(claim_type: &str, value: &str) -> Self {
        Self {
            claim_type: claim_type.to_string(),
            value: value.to_string(),
            destinations: Destinations::NONE,
        }
    }
}

/// Claims plus the scopes and resources granted to one identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimsIdentity {
    pub claims: Vec<Claim>,
    pub scopes: Vec<String>,
    pub resources: Vec<String>,
}

impl ClaimsIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every claim of `claim_type` with a single claim.
    pub fn set_claim(&mut self, claim_type: &str, value: &str) {
        self.claims.retain(|claim| claim.claim_type != claim_type);
        self.claims.push(Claim::new(claim_type, value));
    }

    pub fn add_claim(&mut self, claim_type: &str, value: &str) {
        self.claims.push(Claim::new(claim_type, value));
    }

    pub fn find_first(&self, claim_type: &str) -> Option<&Claim> {
        self.claims.iter().find(|claim| claim.claim_type == claim_type)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|granted| granted == scope)
    }

    pub fn set_scopes<I, S>(&mut self, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
    }

    pub fn set_resources<I, S>(&mut self, resources: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
    }

    /// Assign destinations to every claim with `router`, which sees each
    /// claim together with this identity as its owner.
    pub fn set_destinations<F>(&mut self, router: F)
    where
        F: Fn(&Claim, Option<&ClaimsIdentity>) -> Destinations,
    {
        let routed: Vec<Destinations> = self
            .claims
            .iter()
            .map(|claim| router(claim, Some(self)))
            .collect();
        for (claim, destinations) in self.claims.iter_mut().zip(routed) {
            claim.destinations = destinations;
        }
    }
}

/// The signed-in principal returned to the protocol engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimsPrincipal {
    pub identity: ClaimsIdentity,
}

impl ClaimsPrincipal {
    pub fn new(identity: ClaimsIdentity) -> Self {
        Self { identity }
    }

    pub fn claims(&self) -> &[Claim] {
        &self.identity.claims
    }

    pub fn find_first(&self, claim_type: &str) -> Option<&Claim> {
        self.identity.find_first(claim_type)
    }
}

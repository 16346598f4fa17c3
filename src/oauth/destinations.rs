//! Claim destination routing.
//!
//! Access tokens are read by resource servers and carry every claim except
//! the security stamp. Identity tokens are read by the client, so a claim
//! reaches one only when its owning identity was granted the matching scope.

use crate::oauth::claims::{Claim, ClaimsIdentity, Destinations, claim_types, scopes};

/// Destinations of `claim`, given the identity that owns it.
pub fn destinations(claim: &Claim, owner: Option<&ClaimsIdentity>) -> Destinations {
    let granted = |scope: &str| owner.is_some_and(|identity| identity.has_scope(scope));

    match claim.claim_type.as_str() {
        claim_types::NAME | claim_types::PREFERRED_USERNAME => Destinations {
            access_token: true,
            identity_token: granted(scopes::PROFILE),
        },
        claim_types::EMAIL => Destinations {
            access_token: true,
            identity_token: granted(scopes::EMAIL),
        },
        claim_types::ROLE => Destinations {
            access_token: true,
            identity_token: granted(scopes::ROLES),
        },
        claim_types::SECURITY_STAMP => Destinations::NONE,
        _ => Destinations {
            access_token: true,
            identity_token: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::claims::Destination;

    fn identity_with(scopes: &[&str]) -> ClaimsIdentity {
        let mut identity = ClaimsIdentity::new();
        identity.set_scopes(scopes.iter().copied());
        identity
    }

    #[test]
    fn test_profile_scope_routing() {
        let identity = identity_with(&["profile"]);
        let route = |claim_type: &str| destinations(&Claim::new(claim_type, "v"), Some(&identity));

        let both = Destinations {
            access_token: true,
            identity_token: true,
        };
        let access_only = Destinations {
            access_token: true,
            identity_token: false,
        };

        assert_eq!(route(claim_types::NAME), both);
        assert_eq!(route(claim_types::PREFERRED_USERNAME), both);
        assert_eq!(route(claim_types::EMAIL), access_only);
        assert_eq!(route(claim_types::ROLE), access_only);
        assert_eq!(route(claim_types::SECURITY_STAMP), Destinations::NONE);
        assert_eq!(route(claim_types::SUBJECT), access_only);
    }

    #[test]
    fn test_scopes_unlock_identity_token() {
        let identity = identity_with(&["email", "roles"]);
        let email = destinations(&Claim::new(claim_types::EMAIL, "a@b.c"), Some(&identity));
        let role = destinations(&Claim::new(claim_types::ROLE, "Manager"), Some(&identity));
        let name = destinations(&Claim::new(claim_types::NAME, "n"), Some(&identity));

        assert!(email.contains(Destination::IdentityToken));
        assert!(role.contains(Destination::IdentityToken));
        assert!(!name.contains(Destination::IdentityToken));
    }

    #[test]
    fn test_ownerless_claims_never_reach_identity_token() {
        let name = destinations(&Claim::new(claim_types::NAME, "n"), None);
        assert_eq!(name.iter().collect::<Vec<_>>(), vec![Destination::AccessToken]);

        let stamp = destinations(&Claim::new(claim_types::SECURITY_STAMP, "s"), None);
        assert!(stamp.is_empty());
    }
}

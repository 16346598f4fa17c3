//! Token endpoint grant handling.
//!
//! The protocol engine validates the request and signs the result; this
//! module only builds the principal for the grant types it knows.

use crate::errors::{OAuthError, StorageError};
use crate::oauth::claims::{ClaimsIdentity, ClaimsPrincipal, claim_types};
use crate::oauth::destinations::destinations;
use crate::oauth::types::{Application, GrantType, Scope, TokenRequest};
use crate::storage::unit_of_work::UnitOfWork;

fn server_error(error: StorageError) -> OAuthError {
    OAuthError::ServerError(error.to_string())
}

/// Builds principals for validated token requests. Holds no state between
/// calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenExchangeHandler;

impl TokenExchangeHandler {
    pub fn new() -> Self {
        Self
    }

    pub async fn exchange(
        &self,
        unit_of_work: &UnitOfWork,
        request: &TokenRequest,
    ) -> Result<ClaimsPrincipal, OAuthError> {
        match &request.grant_type {
            GrantType::ClientCredentials => self.client_credentials(unit_of_work, request).await,
            other => Err(OAuthError::GrantTypeNotImplemented(other.to_string())),
        }
    }

    async fn client_credentials(
        &self,
        unit_of_work: &UnitOfWork,
        request: &TokenRequest,
    ) -> Result<ClaimsPrincipal, OAuthError> {
        let client_id = request
            .client_id
            .as_deref()
            .filter(|client_id| !client_id.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("client_id is required".to_string()))?;

        let application = unit_of_work
            .repository::<Application>(false)
            .map_err(server_error)?
            .find(client_id)
            .await
            .map_err(server_error)?
            .ok_or_else(|| OAuthError::ApplicationNotFound(client_id.to_string()))?;

        let mut identity = ClaimsIdentity::new();
        identity.set_claim(claim_types::SUBJECT, &application.client_id);
        if let Some(display_name) = &application.display_name {
            identity.set_claim(claim_types::NAME, display_name);
        }

        identity.set_scopes(request.scopes.iter().cloned());
        let resources = resources_of(unit_of_work, &identity.scopes).await?;
        identity.set_resources(resources);

        identity.set_destinations(destinations);

        tracing::info!(
            client_id = %application.client_id,
            scopes = ?identity.scopes,
            resources = ?identity.resources,
            "client credentials exchange"
        );

        Ok(ClaimsPrincipal::new(identity))
    }
}

/// Resources of the named scopes, in scope order without duplicates. Unknown
/// scopes contribute nothing.
async fn resources_of(
    unit_of_work: &UnitOfWork,
    scope_names: &[String],
) -> Result<Vec<String>, OAuthError> {
    let scopes = unit_of_work
        .repository::<Scope>(false)
        .map_err(server_error)?;

    let mut resources: Vec<String> = Vec::new();
    for name in scope_names {
        let Some(scope) = scopes.find(name).await.map_err(server_error)? else {
            continue;
        };
        for resource in scope.resources {
            if !resources.contains(&resource) {
                resources.push(resource);
            }
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::password::Argon2PasswordHasher;
    use crate::oauth::claims::Destination;
    use crate::storage::inmemory::MemorySessionFactory;
    use std::sync::Arc;

    async fn seeded_unit_of_work(factory: &MemorySessionFactory) -> UnitOfWork {
        let uow = UnitOfWork::open(factory, Arc::new(Argon2PasswordHasher))
            .await
            .unwrap();
        let applications = uow.repository::<Application>(false).unwrap();
        applications
            .insert(&Application::new("scheduler", "Scheduler Client"))
            .unwrap();
        let scopes = uow.repository::<Scope>(false).unwrap();
        scopes
            .insert(&Scope::new("api1", "My API", &["resource_server_1"]))
            .unwrap();
        scopes
            .insert(&Scope::new("api2", "Another API", &["resource_server_2"]))
            .unwrap();
        scopes
            .insert(&Scope::new("offline_access", "Offline Access", &["resource_server_1"]))
            .unwrap();
        uow.save_changes(false).await.unwrap();
        uow
    }

    #[tokio::test]
    async fn test_client_credentials_builds_principal() {
        let factory = MemorySessionFactory::default();
        let uow = seeded_unit_of_work(&factory).await;
        let request =
            TokenRequest::client_credentials("scheduler", &["api1", "offline_access", "api2", "nope"]);

        let principal = TokenExchangeHandler::new()
            .exchange(&uow, &request)
            .await
            .unwrap();

        let subject = principal.find_first(claim_types::SUBJECT).unwrap();
        assert_eq!(subject.value, "scheduler");
        assert_eq!(subject.destinations.iter().collect::<Vec<_>>(), vec![Destination::AccessToken]);

        let name = principal.find_first(claim_types::NAME).unwrap();
        assert_eq!(name.value, "Scheduler Client");
        assert!(!name.destinations.contains(Destination::IdentityToken));

        assert_eq!(
            principal.identity.scopes,
            vec!["api1", "offline_access", "api2", "nope"]
        );
        assert_eq!(
            principal.identity.resources,
            vec!["resource_server_1", "resource_server_2"]
        );
    }

    #[tokio::test]
    async fn test_profile_scope_sends_name_to_identity_token() {
        let factory = MemorySessionFactory::default();
        let uow = seeded_unit_of_work(&factory).await;
        let request = TokenRequest::client_credentials("scheduler", &["profile"]);

        let principal = TokenExchangeHandler::new()
            .exchange(&uow, &request)
            .await
            .unwrap();

        let name = principal.find_first(claim_types::NAME).unwrap();
        assert!(name.destinations.contains(Destination::AccessToken));
        assert!(name.destinations.contains(Destination::IdentityToken));
        assert!(principal.identity.resources.is_empty());
    }

    #[tokio::test]
    async fn test_missing_client_id_is_invalid_request() {
        let factory = MemorySessionFactory::default();
        let uow = seeded_unit_of_work(&factory).await;
        let request = TokenRequest {
            grant_type: GrantType::ClientCredentials,
            client_id: None,
            scopes: Vec::new(),
        };

        assert!(matches!(
            TokenExchangeHandler::new().exchange(&uow, &request).await,
            Err(OAuthError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_disposed_unit_of_work_is_server_error() {
        let factory = MemorySessionFactory::default();
        let uow = seeded_unit_of_work(&factory).await;
        uow.dispose();

        let request = TokenRequest::client_credentials("scheduler", &[]);
        assert!(matches!(
            TokenExchangeHandler::new().exchange(&uow, &request).await,
            Err(OAuthError::ServerError(_))
        ));
    }
}

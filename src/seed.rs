//! Bootstrap data: roles, scopes, client applications and the administrator.
//!
//! Every step opens its own unit of work, creates only what is missing and
//! commits record by record. A record whose commit fails is reported and the
//! remaining records are still seeded.

use crate::config::AdminCredentials;
use crate::errors::{IdentityError, StorageError};
use crate::identity::models::{ApplicationRole, ApplicationUser};
use crate::identity::password::PasswordHasher;
use crate::oauth::types::{Application, ClientType, Scope, permissions};
use crate::storage::session::SessionFactory;
use crate::storage::unit_of_work::{SaveChangesResult, UnitOfWork};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Roles every installation has
pub const ROLES: [&str; 5] = [
    "SuperSystemAdministrator",
    "SystemAdministrator",
    "AccountExecutive",
    "BusinessOwner",
    "Manager",
];

struct ScopeSeed {
    name: &'static str,
    display_name: &'static str,
    resources: &'static [&'static str],
}

const SCOPES: [ScopeSeed; 3] = [
    ScopeSeed {
        name: "api1",
        display_name: "My API",
        resources: &["resource_server_1"],
    },
    ScopeSeed {
        name: "api2",
        display_name: "Another API",
        resources: &["resource_server_2"],
    },
    ScopeSeed {
        name: "offline_access",
        display_name: "Offline Access",
        resources: &["resource_server_1"],
    },
];

struct ClientSeed {
    client_id: &'static str,
    display_name: &'static str,
    permissions: &'static [&'static str],
}

const CLIENTS: [ClientSeed; 3] = [
    ClientSeed {
        client_id: "price_point",
        display_name: "Price Point Client",
        permissions: &[
            permissions::GRANT_TYPE_PASSWORD,
            permissions::GRANT_TYPE_REFRESH_TOKEN,
            permissions::ENDPOINT_TOKEN,
            permissions::GRANT_TYPE_CLIENT_CREDENTIALS,
            permissions::SCOPE_PROFILE,
            permissions::SCOPE_EMAIL,
            permissions::SCOPE_ADDRESS,
            "api1",
            "offline_access",
        ],
    },
    ClientSeed {
        client_id: "api_access_code",
        display_name: "API Access Code Client",
        permissions: &["delegation", "api1", "api2"],
    },
    ClientSeed {
        client_id: "scheduler",
        display_name: "Scheduler Client",
        permissions: &["scheduler", "api1", "api2"],
    },
];

/// Settings for one seeding run
#[derive(Clone, Debug, Default)]
pub struct SeedOptions {
    /// Secret given to every seeded client; clients are public without one
    pub client_secret: Option<String>,
    pub admin: Option<AdminCredentials>,
    pub ensure_history: bool,
}

/// A record that could not be seeded
#[derive(Debug, Clone, Serialize)]
pub struct SeedFailure {
    pub record: String,
    pub error: String,
}

/// What a seeding run did
#[derive(Debug, Default, Serialize)]
pub struct SeedReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub failures: Vec<SeedFailure>,
}

impl SeedReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, record: String, error: impl ToString) {
        let error = error.to_string();
        tracing::warn!(record = %record, error = %error, "seed record failed");
        self.failures.push(SeedFailure { record, error });
    }

    /// Classify a record by the commit that just wrote it. A failed record's
    /// changes are discarded so later commits do not retry them.
    fn committed(&mut self, record: String, unit_of_work: &UnitOfWork) -> Result<(), StorageError> {
        match unit_of_work.last_save_changes_result() {
            SaveChangesResult::Failed(error) => {
                self.fail(record, error);
                unit_of_work.discard_changes()
            }
            _ => {
                self.created.push(record);
                Ok(())
            }
        }
    }
}

/// Seeds roles, scopes, clients and the optional administrator.
pub struct Seeder {
    factory: Arc<dyn SessionFactory>,
    hasher: Arc<dyn PasswordHasher>,
    options: SeedOptions,
    cancellation: CancellationToken,
}

impl Seeder {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        hasher: Arc<dyn PasswordHasher>,
        options: SeedOptions,
    ) -> Self {
        Self {
            factory,
            hasher,
            options,
            cancellation: CancellationToken::new(),
        }
    }

    /// Stop committing once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Run every step. Only disposal and session errors abort the run.
    pub async fn run(&self) -> Result<SeedReport, StorageError> {
        let mut report = SeedReport::default();
        self.seed_roles(&mut report).await?;
        self.seed_scopes(&mut report).await?;
        self.seed_clients(&mut report).await?;
        if let Some(admin) = &self.options.admin {
            self.seed_admin(admin, &mut report).await?;
        }

        tracing::info!(
            created = report.created.len(),
            existing = report.existing.len(),
            failures = report.failures.len(),
            "seeding finished"
        );
        Ok(report)
    }

    async fn unit_of_work(&self) -> Result<UnitOfWork, StorageError> {
        let uow = UnitOfWork::open(self.factory.as_ref(), self.hasher.clone()).await?;
        Ok(uow.with_cancellation(self.cancellation.clone()))
    }

    pub async fn seed_roles(&self, report: &mut SeedReport) -> Result<(), StorageError> {
        let uow = self.unit_of_work().await?;
        let roles = uow.role_manager()?;

        for name in ROLES {
            let record = format!("role:{}", name);
            match roles.role_exists(name).await {
                Ok(true) => {
                    report.existing.push(record);
                    continue;
                }
                Ok(false) => {}
                Err(error) => {
                    report.fail(record, error);
                    continue;
                }
            }
            if let Err(error) = roles.create(&ApplicationRole::new(name)).await {
                report.fail(record, error);
                continue;
            }
            uow.save_changes(self.options.ensure_history).await?;
            report.committed(record, &uow)?;
        }
        Ok(())
    }

    pub async fn seed_scopes(&self, report: &mut SeedReport) -> Result<(), StorageError> {
        let uow = self.unit_of_work().await?;
        let scopes = uow.repository::<Scope>(false)?;
        let known = scopes.get_all().fetch_all().await?;

        uow.set_auto_detect_changes(false)?;
        for seed in &SCOPES {
            let record = format!("scope:{}", seed.name);
            if known.iter().any(|scope| scope.name == seed.name) {
                report.existing.push(record);
                continue;
            }
            let scope = Scope::new(seed.name, seed.display_name, seed.resources);
            if let Err(error) = scopes.insert(&scope) {
                report.fail(record, error);
                continue;
            }
            uow.save_changes(self.options.ensure_history).await?;
            report.committed(record, &uow)?;
        }
        uow.set_auto_detect_changes(true)?;
        Ok(())
    }

    pub async fn seed_clients(&self, report: &mut SeedReport) -> Result<(), StorageError> {
        let uow = self.unit_of_work().await?;
        let applications = uow.repository::<Application>(false)?;
        let known = applications.get_all().fetch_all().await?;

        uow.set_auto_detect_changes(false)?;
        for seed in &CLIENTS {
            let record = format!("client:{}", seed.client_id);
            if known
                .iter()
                .any(|application| application.client_id == seed.client_id)
            {
                report.existing.push(record);
                continue;
            }

            let mut application = Application::new(seed.client_id, seed.display_name);
            application.permissions = seed.permissions.iter().map(|p| p.to_string()).collect();
            if let Some(secret) = &self.options.client_secret {
                match self.hasher.hash_password(secret) {
                    Ok(hash) => {
                        application.client_secret = Some(hash);
                        application.client_type = ClientType::Confidential;
                    }
                    Err(error) => {
                        report.fail(record, error);
                        continue;
                    }
                }
            }

            if let Err(error) = applications.insert(&application) {
                report.fail(record, error);
                continue;
            }
            uow.save_changes(self.options.ensure_history).await?;
            report.committed(record, &uow)?;
        }
        uow.set_auto_detect_changes(true)?;
        Ok(())
    }

    pub async fn seed_admin(
        &self,
        admin: &AdminCredentials,
        report: &mut SeedReport,
    ) -> Result<(), StorageError> {
        let uow = self.unit_of_work().await?;
        let users = uow.user_manager()?;
        let record = format!("user:{}", admin.email);

        let user = match users.find_by_email(&admin.email).await {
            Ok(Some(user)) => {
                report.existing.push(record);
                user
            }
            Ok(None) => {
                let user = ApplicationUser::new(&admin.email, Some(&admin.email))
                    .with_names(admin.first_name.as_deref(), admin.last_name.as_deref());
                let user = match users.create(user, &admin.password).await {
                    Ok(user) => user,
                    Err(error) => {
                        report.fail(record, error);
                        return Ok(());
                    }
                };
                uow.save_changes(self.options.ensure_history).await?;
                if uow.last_save_changes_result().is_failure() {
                    report.committed(record, &uow)?;
                    return Ok(());
                }
                report.created.push(record);
                user
            }
            Err(error) => {
                report.fail(record, error);
                return Ok(());
            }
        };

        for role in ROLES {
            let record = format!("user_role:{}:{}", admin.email, role);
            match users.is_in_role(&user, role).await {
                Ok(true) => {
                    report.existing.push(record);
                    continue;
                }
                Ok(false) => {}
                Err(error) => {
                    report.fail(record, error);
                    continue;
                }
            }
            match users.add_to_role(&user, role).await {
                Ok(()) => {
                    uow.save_changes(self.options.ensure_history).await?;
                    report.committed(record, &uow)?;
                }
                Err(IdentityError::Storage(StorageError::Disposed)) => {
                    return Err(StorageError::Disposed);
                }
                Err(error) => report.fail(record, error),
            }
        }
        Ok(())
    }
}

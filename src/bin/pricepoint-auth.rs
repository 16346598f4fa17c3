//! PricePoint authorization server command-line entry point.
//!
//! Seeds the bootstrap records and runs token exchanges against the configured
//! store. The protocol engine that signs tokens is not part of this binary;
//! `token` prints the principal it would be handed.
//!
//! ```bash
//! STORAGE_BACKEND=postgres DATABASE_URL=postgres://localhost/auth pricepoint-auth seed
//! pricepoint-auth token --client-id scheduler --scope api1 --scope api2
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pricepoint_auth::{
    config::Config,
    identity::{Argon2PasswordHasher, PasswordHasher},
    oauth::{GrantType, TokenExchangeHandler, TokenRequest},
    seed::{SeedOptions, Seeder},
    storage::{SessionFactory, StorageBackend, UnitOfWork, create_session_factory},
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

/// Main CLI application structure
#[derive(Parser)]
#[command(
    name = "pricepoint-auth",
    about = "PricePoint authorization server tooling",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Seed roles, scopes, clients and the configured administrator
    Seed,
    /// Run a token exchange and print the resulting principal
    Token(TokenArgs),
}

#[derive(Args)]
struct TokenArgs {
    /// Client identifier of the requesting application
    #[arg(long, env = "PRICEPOINT_CLIENT_ID")]
    client_id: String,

    /// Grant type of the request
    #[arg(long, default_value = "client_credentials")]
    grant_type: String,

    /// Requested scope; repeat for several
    #[arg(long = "scope")]
    scopes: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pricepoint_auth=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();

    let cli = Cli::parse();

    let version = pricepoint_auth::config::version()?;
    tracing::info!(?version, "Starting pricepoint-auth");

    let config = Config::new()?;
    let backend = config.storage()?;
    let factory = create_session_factory(backend.clone()).await?;
    let hasher: Arc<dyn PasswordHasher> = Arc::new(Argon2PasswordHasher);

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    {
        let tracker = tracker.clone();
        let inner_token = token.clone();

        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::error!("failed to install Ctrl+C handler: {}", err);
                std::future::pending::<()>().await;
            }
        };

        tokio::spawn(async move {
            tokio::select! {
                () = inner_token.cancelled() => { },
                _ = ctrl_c => {},
            }

            tracker.close();
            inner_token.cancel();
        });
    }

    let handle = {
        let inner_token = token.clone();
        tracker.spawn(async move {
            let result = run(cli.command, &config, backend, factory, hasher, inner_token.clone()).await;
            inner_token.cancel();
            result
        })
    };

    tracker.close();
    tracker.wait().await;

    handle.await?
}

async fn run(
    command: Commands,
    config: &Config,
    backend: StorageBackend,
    factory: Arc<dyn SessionFactory>,
    hasher: Arc<dyn PasswordHasher>,
    token: CancellationToken,
) -> Result<()> {
    let seeder = Seeder::new(
        factory.clone(),
        hasher.clone(),
        SeedOptions {
            client_secret: config.seed_client_secret.clone(),
            admin: config.admin_account.as_ref().clone(),
            ensure_history: *config.ensure_auto_history.as_ref(),
        },
    )
    .with_cancellation(token.clone());

    match command {
        Commands::Seed => {
            let report = seeder.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                anyhow::bail!("{} seed record(s) failed", report.failures.len());
            }
        }
        Commands::Token(args) => {
            // The memory store starts empty in every process.
            if backend == StorageBackend::Memory {
                tracing::info!("seeding in-memory store before exchange");
                seeder.run().await?;
            }

            let unit_of_work = UnitOfWork::open(factory.as_ref(), hasher)
                .await?
                .with_cancellation(token);
            let request = TokenRequest {
                grant_type: GrantType::from(args.grant_type.as_str()),
                client_id: Some(args.client_id),
                scopes: args.scopes,
            };

            let principal = TokenExchangeHandler::new()
                .exchange(&unit_of_work, &request)
                .await?;
            println!("{}", serde_json::to_string_pretty(&principal)?);
        }
    }
    Ok(())
}

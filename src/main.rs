#[macro_use]
extern crate rocket;

mod api;
mod auth;
mod db;
mod env;
mod error;
mod forms;
mod models;
mod storage;
mod telemetry;
mod validation;
#[cfg(test)]
mod test;

use std::sync::Arc;

use anyhow::Context;
use auth::{forbidden, not_found, unauthorized, unprocessable};
use db::{connect_options, ensure_bootstrap_admin};
use env::{Settings, load_environment};
use error::AppError;
use models::SubmissionPolicy;
use rocket::data::{Limits, ToByteUnit};
use rocket::{Build, Rocket};
use sqlx::SqlitePool;
use storage::{ObjectStore, S3Storage};
use telemetry::{OtelGuard, TelemetryFairing, init_tracing};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("Application error: {0}")]
    App(#[from] AppError),
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Anyhow(value)
    }
}

#[launch]
async fn rocket() -> _ {
    if let Err(e) = load_environment() {
        eprintln!("Failed to load environment files: {}", e);
    }

    let guard = init_tracing();

    match startup().await {
        Ok((pool, settings, store)) => init_rocket(pool, settings, store, Some(guard)).await,
        Err(e) => {
            error!(error = %e, "Startup failed");
            drop(guard);
            std::process::exit(1);
        }
    }
}

async fn startup() -> Result<(SqlitePool, Settings, Arc<dyn ObjectStore>), Error> {
    let settings = Settings::from_env()?;

    let options =
        connect_options(&settings.database_url).context("DATABASE_URL is not a valid SQLite URL")?;

    let pool = SqlitePool::connect_with(options)
        .await
        .context("Failed to connect to SQLite database")?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Database migration failed")?;
    info!("Migrations completed successfully");

    if let Some(admin) = &settings.bootstrap_admin {
        if ensure_bootstrap_admin(&pool, admin).await? {
            info!(email = %admin.email, "Bootstrap admin created");
        }
    }

    let store: Arc<dyn ObjectStore> = Arc::new(S3Storage::new(&settings.storage).await);

    Ok((pool, settings, store))
}

pub async fn init_rocket(
    pool: SqlitePool,
    settings: Settings,
    store: Arc<dyn ObjectStore>,
    guard: Option<OtelGuard>,
) -> Rocket<Build> {
    info!("Starting study server");

    let limits = Limits::default()
        .limit("file", 64.mebibytes())
        .limit("data-form", 128.mebibytes())
        .limit("json", 8.mebibytes());

    let mut figment = rocket::Config::figment().merge(("limits", limits));
    if let Some(secret) = &settings.auth_secret {
        figment = figment.merge(("secret_key", secret.as_str()));
    }

    let policy = SubmissionPolicy {
        allow_resubmission: settings.allow_resubmission,
    };

    let mut rocket = rocket::custom(figment)
        .manage(pool)
        .manage(settings)
        .manage(policy)
        .manage(store)
        .mount("/api", api::routes())
        .register(
            "/api",
            catchers![unauthorized, forbidden, not_found, unprocessable],
        )
        .attach(TelemetryFairing);

    if let Some(guard) = guard {
        rocket = rocket.manage(guard);
    }

    rocket
}

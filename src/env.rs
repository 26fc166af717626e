use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::AppError;

pub fn load_environment() -> Result<(), Box<dyn std::error::Error>> {
    let is_production =
        dotenvy::var("ROCKET_PROFILE").unwrap_or("development".to_string()) == "production";

    let env_files = if is_production {
        vec!["config/common.env", "config/prod.env", ".secrets.env"]
    } else {
        vec!["config/common.env", "config/dev.env", ".secrets.env"]
    };

    for env_file in env_files {
        load_env_file(env_file)?;
    }

    Ok(())
}

fn load_env_file(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !Path::new(path).exists() {
        warn!("Warning: Environment file {} not found, skipping", path);
        return Ok(());
    }

    dotenvy::from_filename_override(path)?;
    info!("Loaded environment from: {}", path);
    Ok(())
}

/// Everything the service reads from the environment, resolved once at
/// startup and handed to Rocket as managed state.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub storage: StorageSettings,
    pub auth_secret: Option<String>,
    pub bootstrap_admin: Option<BootstrapAdmin>,
    pub allow_resubmission: bool,
    pub session_ttl_hours: i64,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub bucket: String,
    pub endpoint_url: Option<String>,
    pub region: String,
    pub read_credentials: Option<StorageCredentials>,
    pub rw_credentials: Option<StorageCredentials>,
    pub force_path_style: bool,
    pub presigned_url_expiry_secs: u64,
}

#[derive(Clone)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for BootstrapAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapAdmin")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl StorageSettings {
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.presigned_url_expiry_secs)
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url = required("DATABASE_URL")?;

        let endpoint_url = match optional("STORAGE_ENDPOINT_URL") {
            Some(url) => Some(url),
            None => optional("STORAGE_ACCOUNT_ID")
                .map(|account| format!("https://{}.r2.cloudflarestorage.com", account)),
        };

        let storage = StorageSettings {
            bucket: required("STORAGE_BUCKET")?,
            endpoint_url,
            region: optional("STORAGE_REGION").unwrap_or_else(|| "auto".to_string()),
            read_credentials: credentials(
                "STORAGE_READ_ACCESS_KEY_ID",
                "STORAGE_READ_SECRET_ACCESS_KEY",
            )?,
            rw_credentials: credentials(
                "STORAGE_RW_ACCESS_KEY_ID",
                "STORAGE_RW_SECRET_ACCESS_KEY",
            )?,
            force_path_style: parsed("STORAGE_FORCE_PATH_STYLE", false)?,
            presigned_url_expiry_secs: parsed("PRESIGNED_URL_EXPIRY_SECS", 600)?,
        };

        if storage.presigned_url_expiry_secs == 0 {
            return Err(AppError::Validation(
                "PRESIGNED_URL_EXPIRY_SECS must be greater than zero".to_string(),
            ));
        }

        let bootstrap_admin = match (
            optional("BOOTSTRAP_ADMIN_EMAIL"),
            optional("BOOTSTRAP_ADMIN_PASSWORD"),
        ) {
            (Some(email), Some(password)) => Some(BootstrapAdmin { email, password }),
            (None, None) => None,
            _ => {
                return Err(AppError::Validation(
                    "BOOTSTRAP_ADMIN_EMAIL and BOOTSTRAP_ADMIN_PASSWORD must be set together"
                        .to_string(),
                ));
            }
        };

        let session_ttl_hours: i64 = parsed("SESSION_TTL_HOURS", 12)?;
        if session_ttl_hours <= 0 {
            return Err(AppError::Validation(
                "SESSION_TTL_HOURS must be positive".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            storage,
            auth_secret: optional("AUTH_SECRET"),
            bootstrap_admin,
            allow_resubmission: parsed("ALLOW_RESUBMISSION", false)?,
            session_ttl_hours,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn required(key: &str) -> Result<String, AppError> {
    optional(key)
        .ok_or_else(|| AppError::Validation(format!("{} environment variable not set", key)))
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Validation(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

fn credentials(id_key: &str, secret_key: &str) -> Result<Option<StorageCredentials>, AppError> {
    match (optional(id_key), optional(secret_key)) {
        (Some(access_key_id), Some(secret_access_key)) => Ok(Some(StorageCredentials {
            access_key_id,
            secret_access_key,
        })),
        (None, None) => Ok(None),
        _ => Err(AppError::Validation(format!(
            "{} and {} must be set together",
            id_key, secret_key
        ))),
    }
}

use sqlx::{Pool, Sqlite};
use tracing::{info, instrument, warn};

use crate::auth::{DbUser, Role, User};
use crate::env::BootstrapAdmin;
use crate::error::AppError;

const USER_COLUMNS: &str = "SELECT id, email, role, display_name, is_active FROM users";

#[instrument(skip(pool))]
pub async fn get_user(pool: &Pool<Sqlite>, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(&format!("{} WHERE id = ?", USER_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(user) => User::try_from(user),
        None => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument(skip(pool))]
pub async fn find_user_by_email(
    pool: &Pool<Sqlite>,
    email: &str,
) -> Result<Option<User>, AppError> {
    info!("Finding user by email");
    let row = sqlx::query_as::<_, DbUser>(&format!("{} WHERE email = ?", USER_COLUMNS))
        .bind(normalize_email(email))
        .fetch_optional(pool)
        .await?;

    row.map(User::try_from).transpose()
}

#[instrument(skip(pool, password))]
pub async fn create_user(
    pool: &Pool<Sqlite>,
    email: &str,
    password: &str,
    role: Role,
    display_name: Option<&str>,
) -> Result<i64, AppError> {
    info!("Creating user");
    let hashed_password = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;

    let res = sqlx::query(
        "INSERT INTO users (email, password, role, display_name) VALUES (?, ?, ?, ?)",
    )
    .bind(normalize_email(email))
    .bind(hashed_password)
    .bind(role.as_str())
    .bind(display_name)
    .execute(pool)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "An account with this email already exists"))?;

    Ok(res.last_insert_rowid())
}

/// Returns the user only when the email exists, the account is active and
/// the password matches.
#[instrument(skip(pool, password))]
pub async fn authenticate_user(
    pool: &Pool<Sqlite>,
    email: &str,
    password: &str,
) -> Result<Option<User>, AppError> {
    info!("Authenticating user");
    let row: Option<(i64, String, bool)> =
        sqlx::query_as("SELECT id, password, is_active FROM users WHERE email = ?")
            .bind(normalize_email(email))
            .fetch_optional(pool)
            .await?;

    let Some((id, hash, is_active)) = row else {
        return Ok(None);
    };

    if !is_active || !bcrypt::verify(password, &hash).unwrap_or(false) {
        warn!(user_id = id, "Rejected login attempt");
        return Ok(None);
    }

    get_user(pool, id).await.map(Some)
}

#[instrument(skip(pool))]
pub async fn get_all_users(pool: &Pool<Sqlite>) -> Result<Vec<User>, AppError> {
    let rows = sqlx::query_as::<_, DbUser>(&format!("{} ORDER BY id", USER_COLUMNS))
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(User::try_from).collect()
}

#[instrument(skip(pool))]
pub async fn update_user_role(
    pool: &Pool<Sqlite>,
    user_id: i64,
    role: Role,
) -> Result<User, AppError> {
    info!(role = %role, "Updating user role");
    let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
        .bind(role.as_str())
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            user_id
        )));
    }

    get_user(pool, user_id).await
}

/// Creates the configured admin account on first start. An existing
/// account with that email is left untouched.
#[instrument(skip_all, fields(email = %admin.email))]
pub async fn ensure_bootstrap_admin(
    pool: &Pool<Sqlite>,
    admin: &BootstrapAdmin,
) -> Result<bool, AppError> {
    if find_user_by_email(pool, &admin.email).await?.is_some() {
        info!("Bootstrap admin already present");
        return Ok(false);
    }

    create_user(pool, &admin.email, &admin.password, Role::Admin, Some("Administrator")).await?;
    info!("Bootstrap admin created");
    Ok(true)
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

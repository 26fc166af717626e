use chrono::{DateTime, Utc};
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Route, State};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};
use validator::Validate;

use crate::auth::{Role, SESSION_COOKIE, SessionToken, User, UserSession};
use crate::db::{
    authenticate_user, clean_expired_sessions, create_user, create_user_session, get_user,
    invalidate_session,
};
use crate::env::Settings;
use crate::error::AppError;
use crate::validation::JsonValidateExt;

use super::MessageResponse;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,
    #[validate(length(min = 8, message = "password must be at least 8 characters"))]
    pub password: String,
    #[validate(length(min = 1, max = 100, message = "display_name must be 1-100 characters"))]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "email is required"))]
    pub email: String,
    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

#[post("/auth/register", data = "<registration>")]
#[instrument(skip_all)]
pub async fn api_register(
    registration: Json<RegisterRequest>,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<User>>, AppError> {
    let registration = registration.validate_custom()?;

    let user_id = create_user(
        db,
        &registration.email,
        &registration.password,
        Role::Researcher,
        registration.display_name.as_deref(),
    )
    .await?;

    info!(user_id, "Researcher registered");
    let user = get_user(db, user_id).await?;

    Ok(Custom(Status::Created, Json(user)))
}

#[post("/auth/login", data = "<login>")]
#[instrument(skip_all)]
pub async fn api_login(
    login: Json<LoginRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
    settings: &State<Settings>,
) -> Result<Json<LoginResponse>, AppError> {
    let login = login.validate_custom()?;

    let purged = clean_expired_sessions(db).await?;
    if purged > 0 {
        info!(purged, "Removed expired sessions");
    }

    let user = authenticate_user(db, &login.email, &login.password)
        .await?
        .ok_or_else(|| AppError::Authentication("Invalid email or password".to_string()))?;

    let token = UserSession::generate_token();
    let expires_at = UserSession::expiry_from_now(settings.session_ttl_hours);
    create_user_session(db, user.id, &token, expires_at).await?;

    cookies.add_private(
        Cookie::build((SESSION_COOKIE, token.clone()))
            .same_site(SameSite::Lax)
            .http_only(true)
            .max_age(rocket::time::Duration::hours(settings.session_ttl_hours)),
    );

    Ok(Json(LoginResponse {
        token,
        expires_at,
        user,
    }))
}

#[post("/auth/logout")]
#[instrument(skip_all)]
pub async fn api_logout(
    token: Option<SessionToken>,
    cookies: &CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<MessageResponse>, AppError> {
    if let Some(SessionToken(token)) = token {
        invalidate_session(db, &token).await?;
    }

    cookies.remove_private(Cookie::build(SESSION_COOKIE));
    Ok(MessageResponse::new("Logged out"))
}

#[get("/auth/me")]
pub async fn api_me(user: User) -> Json<User> {
    Json(user)
}

pub fn routes() -> Vec<Route> {
    routes![api_register, api_login, api_logout, api_me]
}

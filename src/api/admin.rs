use rocket::serde::json::Json;
use rocket::{Route, State};
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::auth::{Permission, Role, User};
use crate::db::{get_all_users, update_user_role};
use crate::error::AppError;

#[get("/admin/users")]
pub async fn api_get_all_users(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<User>>, AppError> {
    user.require_permission(Permission::ListUsers)?;
    Ok(Json(get_all_users(db).await?))
}

async fn change_role(
    user: &User,
    target_id: i64,
    role: Role,
    db: &Pool<Sqlite>,
) -> Result<Json<User>, AppError> {
    user.require_permission(Permission::EditUserRoles)?;

    if user.id == target_id && role != Role::Admin {
        return Err(AppError::Validation(
            "Admins cannot demote themselves".to_string(),
        ));
    }

    let updated = update_user_role(db, target_id, role).await?;
    info!(admin_id = user.id, target_id, role = %role, "User role changed");
    Ok(Json(updated))
}

#[put("/admin/users/<id>/promote/admin")]
pub async fn api_promote_admin(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<User>, AppError> {
    change_role(&user, id, Role::Admin, db).await
}

#[put("/admin/users/<id>/promote/staff")]
pub async fn api_promote_staff(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<User>, AppError> {
    change_role(&user, id, Role::Staff, db).await
}

#[put("/admin/users/<id>/demote")]
pub async fn api_demote(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<User>, AppError> {
    change_role(&user, id, Role::Researcher, db).await
}

pub fn routes() -> Vec<Route> {
    routes![
        api_get_all_users,
        api_promote_admin,
        api_promote_staff,
        api_demote,
    ]
}

use rocket::serde::json::Json;
use rocket::{Route, State};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use validator::Validate;

use crate::auth::{Permission, User};
use crate::db::{find_user_by_email, results_for_researcher, study_codes_for_researcher};
use crate::error::AppError;
use crate::models::ResultRow;
use crate::validation::JsonValidateExt;

#[derive(Debug, Deserialize, Validate)]
pub struct ResearcherSearch {
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResearcherConfigs {
    pub researcher: User,
    pub study_codes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResearcherResults {
    pub researcher: User,
    pub results: Vec<ResultRow>,
}

async fn lookup(
    search: Json<ResearcherSearch>,
    user: &User,
    db: &Pool<Sqlite>,
) -> Result<User, AppError> {
    user.require_permission(Permission::SearchResearchers)?;
    let search = search.validate_custom()?;

    find_user_by_email(db, &search.email)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No user with email {}", search.email)))
}

#[post("/staff/search", data = "<search>")]
pub async fn api_search_researcher(
    search: Json<ResearcherSearch>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<User>, AppError> {
    Ok(Json(lookup(search, &user, db).await?))
}

#[post("/staff/search/configs", data = "<search>")]
pub async fn api_search_researcher_configs(
    search: Json<ResearcherSearch>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<ResearcherConfigs>, AppError> {
    user.require_permission(Permission::ViewResearcherStudies)?;
    let researcher = lookup(search, &user, db).await?;
    let study_codes = study_codes_for_researcher(db, researcher.id).await?;

    Ok(Json(ResearcherConfigs {
        researcher,
        study_codes,
    }))
}

#[post("/staff/search/results", data = "<search>")]
pub async fn api_search_researcher_results(
    search: Json<ResearcherSearch>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<ResearcherResults>, AppError> {
    user.require_permission(Permission::ViewResearcherResults)?;
    let researcher = lookup(search, &user, db).await?;
    let results = results_for_researcher(db, researcher.id).await?;

    Ok(Json(ResearcherResults {
        researcher,
        results,
    }))
}

pub fn routes() -> Vec<Route> {
    routes![
        api_search_researcher,
        api_search_researcher_configs,
        api_search_researcher_results,
    ]
}

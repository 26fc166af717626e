use rocket::serde::json::Json;
use rocket::{Route, State};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::auth::{Permission, User};
use crate::db::{
    delete_study, export_researcher_csv, export_result_csv, export_study_csv, list_studies_for_researcher,
    paged_results, result_for_subject, results_for_researcher, study_codes_for_researcher,
    summarize_study,
};
use crate::error::AppError;
use crate::models::{PagedResults, ResultRow, StudyListItem, StudySummary};

use super::{FileResponse, MessageResponse};

const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Serialize, Deserialize)]
pub struct StudyCodesResponse {
    pub study_codes: Vec<String>,
}

#[get("/researcher/me")]
pub async fn api_researcher_me(user: User) -> Result<Json<User>, AppError> {
    user.require_permission(Permission::ViewOwnProfile)?;
    Ok(Json(user))
}

#[get("/researcher/studies")]
pub async fn api_list_studies(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<StudyListItem>>, AppError> {
    user.require_permission(Permission::ViewOwnStudies)?;
    Ok(Json(list_studies_for_researcher(db, user.id).await?))
}

#[get("/researcher/configurations")]
pub async fn api_list_study_codes(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<StudyCodesResponse>, AppError> {
    user.require_permission(Permission::ViewOwnStudies)?;
    let study_codes = study_codes_for_researcher(db, user.id).await?;
    Ok(Json(StudyCodesResponse { study_codes }))
}

#[get("/researcher/studies/<study_id>/summary")]
pub async fn api_study_summary(
    study_id: Uuid,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<StudySummary>, AppError> {
    user.require_permission(Permission::ViewOwnStudies)?;
    Ok(Json(summarize_study(db, study_id, user.id).await?))
}

#[get("/researcher/studies/<study_id>/results?<page>&<page_size>")]
pub async fn api_study_results(
    study_id: Uuid,
    page: Option<i64>,
    page_size: Option<i64>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<PagedResults>, AppError> {
    user.require_permission(Permission::ViewOwnStudies)?;

    let results = paged_results(
        db,
        study_id,
        user.id,
        page.unwrap_or(1),
        page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    )
    .await?;

    Ok(Json(results))
}

#[get("/researcher/studies/<study_id>/export.csv")]
pub async fn api_export_study(
    study_id: Uuid,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<FileResponse, AppError> {
    user.require_permission(Permission::ExportOwnResults)?;
    let bytes = export_study_csv(db, study_id, user.id).await?;
    Ok(FileResponse::csv_attachment(
        format!("study_{}.csv", study_id),
        bytes,
    ))
}

#[delete("/researcher/studies/<study_id>")]
pub async fn api_delete_study(
    study_id: Uuid,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<MessageResponse>, AppError> {
    user.require_permission(Permission::DeleteOwnStudies)?;
    delete_study(db, study_id, user.id).await?;
    Ok(MessageResponse::new("Study deleted"))
}

#[get("/researcher/results")]
pub async fn api_researcher_results(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<ResultRow>>, AppError> {
    user.require_permission(Permission::ViewOwnStudies)?;
    Ok(Json(results_for_researcher(db, user.id).await?))
}

#[get("/researcher/result/<subject_id>")]
pub async fn api_researcher_subject_results(
    subject_id: &str,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<ResultRow>>, AppError> {
    user.require_permission(Permission::ViewOwnStudies)?;
    Ok(Json(result_for_subject(db, user.id, subject_id).await?))
}

#[get("/researcher/export/<result_id>")]
pub async fn api_export_result(
    result_id: Uuid,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<FileResponse, AppError> {
    user.require_permission(Permission::ExportOwnResults)?;
    let bytes = export_result_csv(db, result_id, user.id).await?;
    Ok(FileResponse::csv_attachment(
        format!("result_{}.csv", result_id),
        bytes,
    ))
}

#[get("/researcher/export_all")]
pub async fn api_export_all(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<FileResponse, AppError> {
    user.require_permission(Permission::ExportOwnResults)?;
    let bytes = export_researcher_csv(db, user.id).await?;
    Ok(FileResponse::csv_attachment(
        format!("researcher_{}_results.csv", user.id),
        bytes,
    ))
}

pub fn routes() -> Vec<Route> {
    routes![
        api_researcher_me,
        api_list_studies,
        api_list_study_codes,
        api_study_summary,
        api_study_results,
        api_export_study,
        api_delete_study,
        api_researcher_results,
        api_researcher_subject_results,
        api_export_result,
        api_export_all,
    ]
}

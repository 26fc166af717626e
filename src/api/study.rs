use std::sync::Arc;

use rocket::form::Form;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Route, State};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::auth::{Permission, User};
use crate::db::{
    create_configuration, get_configuration, get_configuration_by_code, get_document,
    get_phase_with_images, get_survey_questions, list_configuration_ids, resolve_study_code,
};
use crate::env::Settings;
use crate::error::AppError;
use crate::forms::StudyConfigurationForm;
use crate::models::{
    CreatedConfiguration, DocumentKind, ImagePhase, PhaseWithImages, StudyConfigurationView,
};
use crate::storage::ObjectStore;

use super::FileResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct StudyIdResponse {
    pub config_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SurveyQuestionsResponse {
    pub config_id: Uuid,
    pub questions: Vec<String>,
}

#[post("/config/save", data = "<form>")]
pub async fn api_save_configuration(
    form: Form<StudyConfigurationForm<'_>>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<CreatedConfiguration>>, AppError> {
    user.require_permission(Permission::CreateConfigurations)?;

    let config = form.into_inner().into_new_configuration().await?;
    let created = create_configuration(db, user.id, config).await?;

    Ok(Custom(Status::Created, Json(created)))
}

#[get("/study/study_ids")]
pub async fn api_list_configuration_ids(
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<Uuid>>, AppError> {
    Ok(Json(list_configuration_ids(db).await?))
}

#[get("/study/study_id/<code>")]
pub async fn api_resolve_study_code(
    code: &str,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<StudyIdResponse>, AppError> {
    let config_id = resolve_study_code(db, code).await?;
    Ok(Json(StudyIdResponse { config_id }))
}

#[get("/study/config/<config_id>")]
pub async fn api_get_configuration(
    config_id: Uuid,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<StudyConfigurationView>, AppError> {
    Ok(Json(get_configuration(db, config_id).await?))
}

#[get("/study/<code>/config", rank = 2)]
pub async fn api_get_configuration_by_code(
    code: &str,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<StudyConfigurationView>, AppError> {
    Ok(Json(get_configuration_by_code(db, code).await?))
}

async fn phase(
    config_id: Uuid,
    phase: ImagePhase,
    db: &Pool<Sqlite>,
    store: &Arc<dyn ObjectStore>,
    settings: &Settings,
) -> Result<Json<PhaseWithImages>, AppError> {
    let expiry = settings.storage.presigned_url_expiry();
    let phase = get_phase_with_images(db, store.as_ref(), config_id, phase, expiry).await?;
    Ok(Json(phase))
}

#[get("/study/<config_id>/learning", rank = 2)]
pub async fn api_get_learning_phase(
    config_id: Uuid,
    db: &State<Pool<Sqlite>>,
    store: &State<Arc<dyn ObjectStore>>,
    settings: &State<Settings>,
) -> Result<Json<PhaseWithImages>, AppError> {
    phase(config_id, ImagePhase::Learning, db, store, settings).await
}

#[get("/study/<config_id>/experiment", rank = 2)]
pub async fn api_get_experiment_phase(
    config_id: Uuid,
    db: &State<Pool<Sqlite>>,
    store: &State<Arc<dyn ObjectStore>>,
    settings: &State<Settings>,
) -> Result<Json<PhaseWithImages>, AppError> {
    phase(config_id, ImagePhase::Experiment, db, store, settings).await
}

#[get("/study/<config_id>/survey_questions", rank = 2)]
pub async fn api_get_survey_questions(
    config_id: Uuid,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<SurveyQuestionsResponse>, AppError> {
    let questions = get_survey_questions(db, config_id).await?;
    Ok(Json(SurveyQuestionsResponse {
        config_id,
        questions,
    }))
}

async fn document(
    config_id: Uuid,
    kind: DocumentKind,
    db: &Pool<Sqlite>,
) -> Result<FileResponse, AppError> {
    let document = get_document(db, config_id, kind).await?;
    Ok(FileResponse::inline(document.filename, document.bytes))
}

#[get("/study/<config_id>/consent_form", rank = 2)]
pub async fn api_get_consent_form(
    config_id: Uuid,
    db: &State<Pool<Sqlite>>,
) -> Result<FileResponse, AppError> {
    document(config_id, DocumentKind::ConsentForm, db).await
}

#[get("/study/<config_id>/instructions", rank = 2)]
pub async fn api_get_instructions(
    config_id: Uuid,
    db: &State<Pool<Sqlite>>,
) -> Result<FileResponse, AppError> {
    document(config_id, DocumentKind::Instructions, db).await
}

#[get("/study/<config_id>/debrief", rank = 2)]
pub async fn api_get_debrief(
    config_id: Uuid,
    db: &State<Pool<Sqlite>>,
) -> Result<FileResponse, AppError> {
    document(config_id, DocumentKind::Debrief, db).await
}

pub fn routes() -> Vec<Route> {
    routes![
        api_save_configuration,
        api_list_configuration_ids,
        api_resolve_study_code,
        api_get_configuration,
        api_get_configuration_by_code,
        api_get_learning_phase,
        api_get_experiment_phase,
        api_get_survey_questions,
        api_get_consent_form,
        api_get_instructions,
        api_get_debrief,
    ]
}

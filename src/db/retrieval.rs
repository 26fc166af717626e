use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::get_survey_questions;
use crate::error::AppError;
use crate::models::{
    ConclusionPhase, DocumentKind, ExperimentPhase, FileSummary, ImagePhase, ImageUrl,
    LearningPhase, PhaseWithImages, StudyConfigurationView, UploadedDocument, WaitPhase,
};
use crate::storage::ObjectStore;

static STUDY_CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{6}$").expect("study code pattern is valid"));

const MISSING_PHASE: &str = "Missing phase configuration.";
const MISSING_FILES: &str = "Missing file upload data.";

#[derive(sqlx::FromRow)]
struct DbStudyConfig {
    id: Uuid,
    study_id: Uuid,
    study_code: String,
}

#[derive(sqlx::FromRow)]
struct DbConclusion {
    show_results: bool,
    has_survey: bool,
}

#[derive(sqlx::FromRow)]
struct DbFileSummary {
    consent_form: String,
    study_instructions: String,
    study_debrief: Option<String>,
    learning_list_name: String,
    learning_image_list: String,
    experiment_list_name: String,
    experiment_image_list: String,
}

pub fn normalize_study_code(code: &str) -> Result<String, AppError> {
    let code = code.trim().to_ascii_lowercase();
    if STUDY_CODE_PATTERN.is_match(&code) {
        Ok(code)
    } else {
        Err(AppError::Validation(
            "Study code must be 6 hexadecimal characters".to_string(),
        ))
    }
}

fn parse_image_ids(raw: &str) -> Result<Vec<String>, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Internal(format!("Stored image list is corrupt: {}", e)))
}

#[instrument(skip(pool))]
pub async fn resolve_study_code(pool: &Pool<Sqlite>, code: &str) -> Result<Uuid, AppError> {
    let code = normalize_study_code(code)?;

    let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM study_configs WHERE study_code = ?")
        .bind(&code)
        .fetch_optional(pool)
        .await?;

    row.map(|(id,)| id)
        .ok_or_else(|| AppError::NotFound(format!("No study found for code {}", code)))
}

#[instrument(skip(pool))]
pub async fn list_configuration_ids(pool: &Pool<Sqlite>) -> Result<Vec<Uuid>, AppError> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT id FROM study_configs ORDER BY created_at, rowid")
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

async fn fetch_study_config(pool: &Pool<Sqlite>, config_id: Uuid) -> Result<DbStudyConfig, AppError> {
    sqlx::query_as::<_, DbStudyConfig>(
        "SELECT id, study_id, study_code FROM study_configs WHERE id = ?",
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Study configuration {} not found", config_id)))
}

async fn fetch_learning(pool: &Pool<Sqlite>, config_id: Uuid) -> Result<LearningPhase, AppError> {
    sqlx::query_as::<_, LearningPhase>(
        "SELECT display_duration, pause_duration, display_method
         FROM learning_configs WHERE study_config_id = ?",
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Internal(MISSING_PHASE.to_string()))
}

async fn fetch_experiment(
    pool: &Pool<Sqlite>,
    config_id: Uuid,
) -> Result<ExperimentPhase, AppError> {
    sqlx::query_as::<_, ExperimentPhase>(
        "SELECT display_duration, pause_duration, display_method, response_method
         FROM experiment_configs WHERE study_config_id = ?",
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Internal(MISSING_PHASE.to_string()))
}

async fn fetch_image_ids(
    pool: &Pool<Sqlite>,
    config_id: Uuid,
    phase: ImagePhase,
) -> Result<Vec<String>, AppError> {
    let column = match phase {
        ImagePhase::Learning => "learning_image_list",
        ImagePhase::Experiment => "experiment_image_list",
    };

    let row: Option<(String,)> = sqlx::query_as(&format!(
        "SELECT {} FROM uploaded_files WHERE study_config_id = ?",
        column
    ))
    .bind(config_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((raw,)) => parse_image_ids(&raw),
        None => Err(AppError::Internal(MISSING_FILES.to_string())),
    }
}

/// Loads a configuration with all four phases and its file summary. A
/// configuration missing any of its parts is reported as an internal error.
#[instrument(skip(pool))]
pub async fn get_configuration(
    pool: &Pool<Sqlite>,
    config_id: Uuid,
) -> Result<StudyConfigurationView, AppError> {
    info!("Loading study configuration");
    let config = fetch_study_config(pool, config_id).await?;

    let learning = fetch_learning(pool, config_id).await?;

    let wait = sqlx::query_as::<_, WaitPhase>(
        "SELECT display_duration FROM wait_configs WHERE study_config_id = ?",
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Internal(MISSING_PHASE.to_string()))?;

    let experiment = fetch_experiment(pool, config_id).await?;

    let conclusion = sqlx::query_as::<_, DbConclusion>(
        "SELECT show_results, has_survey FROM conclusion_configs WHERE study_config_id = ?",
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Internal(MISSING_PHASE.to_string()))?;

    let files = sqlx::query_as::<_, DbFileSummary>(
        "SELECT consent_form, study_instructions, study_debrief, learning_list_name,
                learning_image_list, experiment_list_name, experiment_image_list
         FROM uploaded_files WHERE study_config_id = ?",
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Internal(MISSING_FILES.to_string()))?;

    let questions = if conclusion.has_survey {
        Some(get_survey_questions(pool, config_id).await?)
    } else {
        None
    };

    Ok(StudyConfigurationView {
        config_id: config.id,
        study_id: config.study_id,
        study_code: config.study_code,
        learning,
        wait,
        experiment,
        conclusion: ConclusionPhase {
            show_results: conclusion.show_results,
            has_survey: conclusion.has_survey,
            questions,
        },
        files: FileSummary {
            consent_form: files.consent_form,
            study_instructions: files.study_instructions,
            study_debrief: files.study_debrief,
            learning_list: files.learning_list_name,
            experiment_list: files.experiment_list_name,
            learning_image_list: parse_image_ids(&files.learning_image_list)?,
            experiment_image_list: parse_image_ids(&files.experiment_image_list)?,
        },
    })
}

#[instrument(skip(pool))]
pub async fn get_configuration_by_code(
    pool: &Pool<Sqlite>,
    code: &str,
) -> Result<StudyConfigurationView, AppError> {
    let config_id = resolve_study_code(pool, code).await?;
    get_configuration(pool, config_id).await
}

/// Phase parameters plus a freshly presigned URL for every image, in the
/// order the images were uploaded. URLs are never stored.
#[instrument(skip(pool, store))]
pub async fn get_phase_with_images(
    pool: &Pool<Sqlite>,
    store: &dyn ObjectStore,
    config_id: Uuid,
    phase: ImagePhase,
    expiry: Duration,
) -> Result<PhaseWithImages, AppError> {
    fetch_study_config(pool, config_id).await?;

    let image_ids = fetch_image_ids(pool, config_id, phase).await?;
    let expires_at = Utc::now()
        + chrono::Duration::from_std(expiry)
            .map_err(|e| AppError::Internal(format!("Invalid expiry: {}", e)))?;

    let mut images = Vec::with_capacity(image_ids.len());
    for image_id in image_ids {
        let url = store.presign_get(&image_id, expiry).await?;
        images.push(ImageUrl { image_id, url });
    }

    info!(image_count = images.len(), "Presigned phase images");

    Ok(match phase {
        ImagePhase::Learning => PhaseWithImages::Learning {
            config: fetch_learning(pool, config_id).await?,
            images,
            expires_at,
        },
        ImagePhase::Experiment => PhaseWithImages::Experiment {
            config: fetch_experiment(pool, config_id).await?,
            images,
            expires_at,
        },
    })
}

#[instrument(skip(pool))]
pub async fn get_document(
    pool: &Pool<Sqlite>,
    config_id: Uuid,
    kind: DocumentKind,
) -> Result<UploadedDocument, AppError> {
    let query = match kind {
        DocumentKind::ConsentForm => {
            "SELECT consent_form, consent_form_bytes FROM uploaded_files WHERE study_config_id = ?"
        }
        DocumentKind::Instructions => {
            "SELECT study_instructions, study_instructions_bytes FROM uploaded_files WHERE study_config_id = ?"
        }
        DocumentKind::Debrief => {
            "SELECT study_debrief, study_debrief_bytes FROM uploaded_files WHERE study_config_id = ?"
        }
    };

    let row: Option<(Option<String>, Option<Vec<u8>>)> = sqlx::query_as(query)
        .bind(config_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((Some(filename), Some(bytes))) => Ok(UploadedDocument { filename, bytes }),
        _ => Err(AppError::NotFound(format!(
            "No {} found for configuration {}",
            kind.label(),
            config_id
        ))),
    }
}

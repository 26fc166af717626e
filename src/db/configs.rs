use chrono::Utc;
use rand::Rng;
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::begin_write;
use crate::error::AppError;
use crate::models::{CreatedConfiguration, NewStudyConfiguration};

const STUDY_CODE_LENGTH: usize = 6;
const MAX_CODE_ATTEMPTS: usize = 8;

/// The first code tried for a configuration: the last six hex digits of
/// its id.
pub fn code_from_config_id(config_id: Uuid) -> String {
    let hex = config_id.simple().to_string();
    hex[hex.len() - STUDY_CODE_LENGTH..].to_string()
}

fn random_code() -> String {
    format!("{:06x}", rand::rng().random_range(0..0x0100_0000u32))
}

async fn study_code_taken(conn: &mut SqliteConnection, code: &str) -> Result<bool, AppError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM study_configs WHERE study_code = ?")
        .bind(code)
        .fetch_optional(conn)
        .await?;

    Ok(row.is_some())
}

pub(crate) async fn allocate_study_code(
    conn: &mut SqliteConnection,
    config_id: Uuid,
) -> Result<String, AppError> {
    pick_study_code(conn, code_from_config_id(config_id), random_code).await
}

/// Tries `first`, then codes from `next`, returning the first one no
/// configuration uses yet.
pub(crate) async fn pick_study_code(
    conn: &mut SqliteConnection,
    first: String,
    mut next: impl FnMut() -> String,
) -> Result<String, AppError> {
    let mut candidate = first;

    for attempt in 1..=MAX_CODE_ATTEMPTS {
        if !study_code_taken(conn, &candidate).await? {
            return Ok(candidate);
        }

        warn!(attempt, code = %candidate, "Study code collision");
        candidate = next();
    }

    Err(AppError::Internal(
        "Could not allocate a unique study code".to_string(),
    ))
}

/// Creates a study together with its first configuration. Every row is
/// written in a single transaction; nothing is persisted unless all of it
/// is.
#[instrument(skip(pool, config))]
pub async fn create_configuration(
    pool: &Pool<Sqlite>,
    researcher_id: i64,
    config: NewStudyConfiguration,
) -> Result<CreatedConfiguration, AppError> {
    info!("Creating study configuration");

    let study_id = Uuid::new_v4();
    let config_id = Uuid::new_v4();
    let now = Utc::now();

    let mut tx = begin_write(pool).await?;

    sqlx::query("INSERT INTO studies (id, researcher_id, created_at) VALUES (?, ?, ?)")
        .bind(study_id)
        .bind(researcher_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    let study_code = allocate_study_code(&mut *tx, config_id).await?;

    sqlx::query(
        "INSERT INTO study_configs (id, study_id, study_code, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(config_id)
    .bind(study_id)
    .bind(&study_code)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "Study code already in use"))?;

    let learning = &config.learning;
    sqlx::query(
        "INSERT INTO learning_configs (study_config_id, display_duration, pause_duration, display_method)
         VALUES (?, ?, ?, ?)",
    )
    .bind(config_id)
    .bind(learning.display_duration)
    .bind(learning.pause_duration)
    .bind(learning.display_method)
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO wait_configs (study_config_id, display_duration) VALUES (?, ?)")
        .bind(config_id)
        .bind(config.wait.display_duration)
        .execute(&mut *tx)
        .await?;

    let experiment = &config.experiment;
    sqlx::query(
        "INSERT INTO experiment_configs
         (study_config_id, display_duration, pause_duration, display_method, response_method)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(config_id)
    .bind(experiment.display_duration)
    .bind(experiment.pause_duration)
    .bind(experiment.display_method)
    .bind(experiment.response_method)
    .execute(&mut *tx)
    .await?;

    let conclusion = &config.conclusion;
    sqlx::query(
        "INSERT INTO conclusion_configs (study_config_id, show_results, has_survey) VALUES (?, ?, ?)",
    )
    .bind(config_id)
    .bind(conclusion.show_results)
    .bind(conclusion.has_survey)
    .execute(&mut *tx)
    .await?;

    let files = &config.files;
    let debrief = files.study_debrief.as_ref();
    sqlx::query(
        "INSERT INTO uploaded_files
         (study_config_id, consent_form, consent_form_bytes, study_instructions, study_instructions_bytes,
          study_debrief, study_debrief_bytes, learning_list_name, learning_image_list,
          experiment_list_name, experiment_image_list)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(config_id)
    .bind(&files.consent_form.filename)
    .bind(&files.consent_form.bytes)
    .bind(&files.study_instructions.filename)
    .bind(&files.study_instructions.bytes)
    .bind(debrief.map(|doc| doc.filename.as_str()))
    .bind(debrief.map(|doc| doc.bytes.as_slice()))
    .bind(&files.learning_images.filename)
    .bind(serde_json::to_string(&files.learning_images.image_ids)?)
    .bind(&files.experiment_images.filename)
    .bind(serde_json::to_string(&files.experiment_images.image_ids)?)
    .execute(&mut *tx)
    .await?;

    if conclusion.has_survey {
        let survey_id = Uuid::new_v4();
        sqlx::query("INSERT INTO survey_configs (id, study_config_id) VALUES (?, ?)")
            .bind(survey_id)
            .bind(config_id)
            .execute(&mut *tx)
            .await?;

        for (index, question) in conclusion.questions.iter().flatten().enumerate() {
            sqlx::query(
                "INSERT INTO survey_questions (survey_config_id, position, text) VALUES (?, ?, ?)",
            )
            .bind(survey_id)
            .bind(index as i64 + 1)
            .bind(question)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    info!(%study_id, %config_id, code = %study_code, "Study configuration created");

    Ok(CreatedConfiguration {
        study_id,
        config_id,
        study_code,
    })
}

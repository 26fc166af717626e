use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::SurveyAnswer;
use crate::validation::validated;

#[instrument(skip(pool, answer), fields(subject_id = %answer.subject_id))]
pub async fn save_survey_answer(
    pool: &Pool<Sqlite>,
    answer: SurveyAnswer,
) -> Result<SurveyAnswer, AppError> {
    let answer = validated(SurveyAnswer {
        subject_id: answer.subject_id.trim().to_string(),
        age: answer.age,
        sex: answer.sex.trim().to_string(),
        race: answer.race.trim().to_string(),
    })?;

    sqlx::query(
        "INSERT INTO survey_answers (subject_id, age, sex, race, submitted_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&answer.subject_id)
    .bind(answer.age)
    .bind(&answer.sex)
    .bind(&answer.race)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "Survey already submitted for this subject"))?;

    info!("Survey answer saved");
    get_survey_answer(pool, &answer.subject_id).await
}

#[instrument(skip(pool))]
pub async fn get_survey_answer(
    pool: &Pool<Sqlite>,
    subject_id: &str,
) -> Result<SurveyAnswer, AppError> {
    sqlx::query_as::<_, SurveyAnswer>(
        "SELECT subject_id, age, sex, race FROM survey_answers WHERE subject_id = ?",
    )
    .bind(subject_id.trim())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("No survey answer for subject {}", subject_id)))
}

/// Ordered question texts for a configuration; empty when it has no survey.
#[instrument(skip(pool))]
pub async fn get_survey_questions(
    pool: &Pool<Sqlite>,
    config_id: Uuid,
) -> Result<Vec<String>, AppError> {
    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM study_configs WHERE id = ?")
        .bind(config_id)
        .fetch_optional(pool)
        .await?;

    if exists.is_none() {
        return Err(AppError::NotFound(format!(
            "Study configuration {} not found",
            config_id
        )));
    }

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT q.text FROM survey_questions q
         JOIN survey_configs s ON s.id = q.survey_config_id
         WHERE s.study_config_id = ?
         ORDER BY q.position",
    )
    .bind(config_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(text,)| text).collect())
}

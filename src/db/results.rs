use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::begin_write;
use crate::error::AppError;
use crate::models::{ResponseSubmission, SubmissionPolicy};
use crate::validation::validated;

const DUPLICATE_SUBMISSION: &str = "Results already submitted for this subject";
const DUPLICATE_RESPONSES: &str = "Responses already recorded for this result";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedResult {
    pub result_id: Uuid,
    pub response_count: usize,
}

fn submission_key(study_id: Uuid, subject_id: &str) -> String {
    format!("{}:{}", study_id, subject_id)
}

async fn insert_result(
    conn: &mut SqliteConnection,
    config_id: Uuid,
    subject_id: &str,
    policy: SubmissionPolicy,
) -> Result<Uuid, AppError> {
    let subject_id = subject_id.trim();
    if subject_id.is_empty() {
        return Err(AppError::Validation(
            "subject_id must not be empty".to_string(),
        ));
    }

    let study: Option<(Uuid,)> = sqlx::query_as("SELECT study_id FROM study_configs WHERE id = ?")
        .bind(config_id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some((study_id,)) = study else {
        return Err(AppError::NotFound(format!(
            "Study configuration {} not found",
            config_id
        )));
    };

    let key = (!policy.allow_resubmission).then(|| submission_key(study_id, subject_id));

    if let Some(key) = &key {
        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM study_results WHERE submission_key = ?")
                .bind(key)
                .fetch_optional(&mut *conn)
                .await?;

        if existing.is_some() {
            warn!(%study_id, subject_id, "Duplicate submission rejected");
            return Err(AppError::Conflict(DUPLICATE_SUBMISSION.to_string()));
        }
    }

    let result_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO study_results (id, study_id, config_id, subject_id, submitted, submission_key)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(result_id)
    .bind(study_id)
    .bind(config_id)
    .bind(subject_id)
    .bind(Utc::now())
    .bind(key)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, DUPLICATE_SUBMISSION))?;

    Ok(result_id)
}

async fn insert_responses(
    conn: &mut SqliteConnection,
    result_id: Uuid,
    responses: Vec<ResponseSubmission>,
) -> Result<usize, AppError> {
    let responses = responses
        .into_iter()
        .map(validated)
        .collect::<Result<Vec<_>, _>>()?;

    let existing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM study_responses WHERE result_id = ?")
        .bind(result_id)
        .fetch_one(&mut *conn)
        .await?;

    if existing.0 > 0 {
        return Err(AppError::Conflict(DUPLICATE_RESPONSES.to_string()));
    }

    for (index, response) in responses.iter().enumerate() {
        sqlx::query(
            "INSERT INTO study_responses (result_id, sequence, image_id, answer, response_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(result_id)
        .bind(index as i64 + 1)
        .bind(&response.image_id)
        .bind(response.answer)
        .bind(response.response_time)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::conflict_on_unique(e, DUPLICATE_RESPONSES))?;
    }

    Ok(responses.len())
}

/// Opens a result set for a subject. With resubmission disallowed a second
/// result for the same study and subject is a conflict.
#[instrument(skip(pool))]
pub async fn start_result(
    pool: &Pool<Sqlite>,
    config_id: Uuid,
    subject_id: &str,
    policy: SubmissionPolicy,
) -> Result<Uuid, AppError> {
    let mut tx = begin_write(pool).await?;
    let result_id = insert_result(&mut *tx, config_id, subject_id, policy).await?;
    tx.commit().await?;

    info!(%result_id, "Result set started");
    Ok(result_id)
}

/// Stores responses in submission order with 1-based sequence numbers.
#[instrument(skip(pool, responses), fields(response_count = responses.len()))]
pub async fn record_responses(
    pool: &Pool<Sqlite>,
    result_id: Uuid,
    responses: Vec<ResponseSubmission>,
) -> Result<usize, AppError> {
    let mut tx = begin_write(pool).await?;

    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM study_results WHERE id = ?")
        .bind(result_id)
        .fetch_optional(&mut *tx)
        .await?;

    if exists.is_none() {
        return Err(AppError::NotFound(format!(
            "Result set {} not found",
            result_id
        )));
    }

    let count = insert_responses(&mut *tx, result_id, responses).await?;
    tx.commit().await?;

    info!(count, "Responses recorded");
    Ok(count)
}

/// Creates the result set and its responses in one transaction.
#[instrument(skip(pool, responses), fields(response_count = responses.len()))]
pub async fn submit_results(
    pool: &Pool<Sqlite>,
    config_id: Uuid,
    subject_id: &str,
    responses: Vec<ResponseSubmission>,
    policy: SubmissionPolicy,
) -> Result<SubmittedResult, AppError> {
    let mut tx = begin_write(pool).await?;

    let result_id = insert_result(&mut *tx, config_id, subject_id, policy).await?;
    let response_count = insert_responses(&mut *tx, result_id, responses).await?;

    tx.commit().await?;

    info!(%result_id, response_count, "Results submitted");
    Ok(SubmittedResult {
        result_id,
        response_count,
    })
}

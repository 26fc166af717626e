use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};
use uuid::Uuid;

use super::begin_write;
use crate::error::AppError;
use crate::models::{
    PagedResults, ResultRow, StudyListItem, StudyResponse, StudyResult, StudySummary,
};

pub const MAX_PAGE_SIZE: i64 = 500;

const EXPORT_HEADER: [&str; 8] = [
    "study_results_id",
    "subject_id",
    "config_id",
    "submitted",
    "sequence",
    "image_id",
    "answer",
    "response_time",
];
const SURVEY_HEADER: [&str; 3] = ["age", "sex", "race"];

const RESULT_ROW_SELECT: &str = "SELECT r.id, r.subject_id, r.config_id, r.submitted,
        (SELECT COUNT(*) FROM study_responses sr WHERE sr.result_id = r.id) AS response_count,
        COALESCE(json_array_length(u.experiment_image_list), 0) AS expected_items
     FROM study_results r
     JOIN studies s ON s.id = r.study_id
     LEFT JOIN uploaded_files u ON u.study_config_id = r.config_id";

#[derive(sqlx::FromRow)]
struct DbResultRow {
    id: Uuid,
    subject_id: String,
    config_id: Uuid,
    submitted: DateTime<Utc>,
    response_count: i64,
    expected_items: i64,
}

#[derive(sqlx::FromRow)]
struct DbExportRow {
    result_id: Uuid,
    subject_id: String,
    config_id: Uuid,
    submitted: DateTime<Utc>,
    sequence: i64,
    image_id: String,
    answer: i64,
    response_time: f64,
    age: Option<i64>,
    sex: Option<String>,
    race: Option<String>,
}

/// Fails with not-found unless `caller_id` owns the study, so callers
/// cannot probe for other researchers' studies.
#[instrument(skip(pool))]
pub async fn ensure_ownership(
    pool: &Pool<Sqlite>,
    study_id: Uuid,
    caller_id: i64,
) -> Result<(), AppError> {
    let owner: Option<(i64,)> = sqlx::query_as("SELECT researcher_id FROM studies WHERE id = ?")
        .bind(study_id)
        .fetch_optional(pool)
        .await?;

    match owner {
        Some((researcher_id,)) if researcher_id == caller_id => Ok(()),
        _ => Err(AppError::NotFound(format!("Study {} not found", study_id))),
    }
}

#[instrument(skip(pool))]
pub async fn list_studies_for_researcher(
    pool: &Pool<Sqlite>,
    researcher_id: i64,
) -> Result<Vec<StudyListItem>, AppError> {
    info!("Listing studies for researcher");

    let rows = sqlx::query_as::<_, StudyListItem>(
        "SELECT s.id AS study_id, s.created_at,
            (SELECT c.id FROM study_configs c WHERE c.study_id = s.id
             ORDER BY c.created_at DESC, c.rowid DESC LIMIT 1) AS configuration_id,
            (SELECT c.study_code FROM study_configs c WHERE c.study_id = s.id
             ORDER BY c.created_at DESC, c.rowid DESC LIMIT 1) AS study_code,
            (SELECT COUNT(*) FROM study_results r WHERE r.study_id = s.id) AS total_submissions,
            (SELECT MAX(r.submitted) FROM study_results r WHERE r.study_id = s.id) AS last_submission_at,
            COALESCE((SELECT json_array_length(u.experiment_image_list)
                      FROM study_configs c JOIN uploaded_files u ON u.study_config_id = c.id
                      WHERE c.study_id = s.id
                      ORDER BY c.created_at DESC, c.rowid DESC LIMIT 1), 0) AS expected_items
         FROM studies s
         WHERE s.researcher_id = ?
         ORDER BY s.created_at DESC, s.rowid DESC",
    )
    .bind(researcher_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[instrument(skip(pool))]
pub async fn study_codes_for_researcher(
    pool: &Pool<Sqlite>,
    researcher_id: i64,
) -> Result<Vec<String>, AppError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT c.study_code FROM study_configs c
         JOIN studies s ON s.id = c.study_id
         WHERE s.researcher_id = ?
         ORDER BY c.created_at, c.rowid",
    )
    .bind(researcher_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(code,)| code).collect())
}

pub fn completion_rate(complete: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    let rate = complete as f64 * 100.0 / total as f64;
    (rate * 100.0).round() / 100.0
}

#[instrument(skip(pool))]
pub async fn summarize_study(
    pool: &Pool<Sqlite>,
    study_id: Uuid,
    caller_id: i64,
) -> Result<StudySummary, AppError> {
    ensure_ownership(pool, study_id, caller_id).await?;

    let (total_submissions,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM study_results WHERE study_id = ?")
            .bind(study_id)
            .fetch_one(pool)
            .await?;

    let (expected_items,): (i64,) = sqlx::query_as(
        "SELECT COALESCE((SELECT json_array_length(u.experiment_image_list)
                          FROM study_configs c JOIN uploaded_files u ON u.study_config_id = c.id
                          WHERE c.study_id = ?
                          ORDER BY c.created_at DESC, c.rowid DESC LIMIT 1), 0)",
    )
    .bind(study_id)
    .fetch_one(pool)
    .await?;

    // A result is complete against the configuration it was submitted for.
    let (complete_submissions,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM study_results r
         JOIN uploaded_files u ON u.study_config_id = r.config_id
         WHERE r.study_id = ?
           AND (SELECT COUNT(*) FROM study_responses sr WHERE sr.result_id = r.id)
               = json_array_length(u.experiment_image_list)",
    )
    .bind(study_id)
    .fetch_one(pool)
    .await?;

    let (avg_response_time,): (Option<f64>,) = sqlx::query_as(
        "SELECT AVG(sr.response_time) FROM study_responses sr
         JOIN study_results r ON r.id = sr.result_id
         WHERE r.study_id = ?",
    )
    .bind(study_id)
    .fetch_one(pool)
    .await?;

    let histogram: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT sr.answer, COUNT(*) FROM study_responses sr
         JOIN study_results r ON r.id = sr.result_id
         WHERE r.study_id = ?
         GROUP BY sr.answer",
    )
    .bind(study_id)
    .fetch_all(pool)
    .await?;

    Ok(StudySummary {
        study_id,
        total_submissions,
        expected_items,
        complete_submissions,
        completion_rate: completion_rate(complete_submissions, total_submissions),
        avg_response_time,
        answer_histogram: histogram.into_iter().collect::<BTreeMap<_, _>>(),
    })
}

async fn responses_for_result(
    pool: &Pool<Sqlite>,
    result_id: Uuid,
) -> Result<Vec<StudyResponse>, AppError> {
    let responses = sqlx::query_as::<_, StudyResponse>(
        "SELECT sequence, image_id, answer, response_time FROM study_responses
         WHERE result_id = ? ORDER BY sequence",
    )
    .bind(result_id)
    .fetch_all(pool)
    .await?;

    Ok(responses)
}

async fn attach_responses(
    pool: &Pool<Sqlite>,
    rows: Vec<DbResultRow>,
) -> Result<Vec<ResultRow>, AppError> {
    let mut items = Vec::with_capacity(rows.len());

    for row in rows {
        let responses = responses_for_result(pool, row.id).await?;
        items.push(ResultRow {
            study_results_id: row.id,
            subject_id: row.subject_id,
            config_id: row.config_id,
            submitted: row.submitted,
            is_complete: row.response_count == row.expected_items,
            responses,
        });
    }

    Ok(items)
}

#[instrument(skip(pool))]
pub async fn paged_results(
    pool: &Pool<Sqlite>,
    study_id: Uuid,
    caller_id: i64,
    page: i64,
    page_size: i64,
) -> Result<PagedResults, AppError> {
    if page < 1 {
        return Err(AppError::Validation("page must be at least 1".to_string()));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(AppError::Validation(format!(
            "page_size must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }

    let offset = (page - 1)
        .checked_mul(page_size)
        .ok_or_else(|| AppError::Validation("page is out of range".to_string()))?;

    ensure_ownership(pool, study_id, caller_id).await?;

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM study_results WHERE study_id = ?")
        .bind(study_id)
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query_as::<_, DbResultRow>(&format!(
        "{} WHERE r.study_id = ? ORDER BY r.submitted DESC, r.rowid DESC LIMIT ? OFFSET ?",
        RESULT_ROW_SELECT
    ))
    .bind(study_id)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(PagedResults {
        items: attach_responses(pool, rows).await?,
        page,
        page_size,
        total,
    })
}

/// Every result set across all studies the researcher owns.
#[instrument(skip(pool))]
pub async fn results_for_researcher(
    pool: &Pool<Sqlite>,
    researcher_id: i64,
) -> Result<Vec<ResultRow>, AppError> {
    let rows = sqlx::query_as::<_, DbResultRow>(&format!(
        "{} WHERE s.researcher_id = ? ORDER BY r.submitted DESC, r.rowid DESC",
        RESULT_ROW_SELECT
    ))
    .bind(researcher_id)
    .fetch_all(pool)
    .await?;

    attach_responses(pool, rows).await
}

#[instrument(skip(pool))]
pub async fn result_for_subject(
    pool: &Pool<Sqlite>,
    researcher_id: i64,
    subject_id: &str,
) -> Result<Vec<ResultRow>, AppError> {
    let rows = sqlx::query_as::<_, DbResultRow>(&format!(
        "{} WHERE s.researcher_id = ? AND r.subject_id = ? ORDER BY r.submitted DESC, r.rowid DESC",
        RESULT_ROW_SELECT
    ))
    .bind(researcher_id)
    .bind(subject_id.trim())
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Err(AppError::NotFound(format!(
            "No results found for subject {}",
            subject_id
        )));
    }

    attach_responses(pool, rows).await
}

/// Which result sets an export covers.
#[derive(Debug, Clone, Copy)]
enum ExportScope {
    Study(Uuid),
    Result(Uuid),
    Researcher(i64),
}

impl ExportScope {
    fn filter(&self) -> &'static str {
        match self {
            ExportScope::Study(_) => "r.study_id",
            ExportScope::Result(_) => "r.id",
            ExportScope::Researcher(_) => "s.researcher_id",
        }
    }
}

/// Writing into an in-memory buffer only fails on our side.
pub(crate) fn export_error(error: csv::Error) -> AppError {
    AppError::Internal(format!("Failed to write CSV export: {}", error))
}

async fn write_export(
    pool: &Pool<Sqlite>,
    scope: ExportScope,
    include_survey: bool,
) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<&str> = EXPORT_HEADER.to_vec();
    if include_survey {
        header.extend(SURVEY_HEADER);
    }
    writer.write_record(&header).map_err(export_error)?;

    let sql = format!(
        "SELECT r.id AS result_id, r.subject_id, r.config_id, r.submitted,
                sr.sequence, sr.image_id, sr.answer, sr.response_time,
                sa.age, sa.sex, sa.race
         FROM study_results r
         JOIN studies s ON s.id = r.study_id
         JOIN study_responses sr ON sr.result_id = r.id
         LEFT JOIN survey_answers sa ON sa.subject_id = r.subject_id
         WHERE {} = ?
         ORDER BY r.submitted, r.rowid, sr.sequence",
        scope.filter()
    );

    let query = sqlx::query_as::<_, DbExportRow>(&sql);
    let query = match scope {
        ExportScope::Study(id) | ExportScope::Result(id) => query.bind(id),
        ExportScope::Researcher(id) => query.bind(id),
    };
    let mut rows = query.fetch(pool);
    let mut written = 0usize;

    while let Some(row) = rows.try_next().await? {
        let mut record = vec![
            row.result_id.to_string(),
            row.subject_id,
            row.config_id.to_string(),
            row.submitted.to_rfc3339(),
            row.sequence.to_string(),
            row.image_id,
            row.answer.to_string(),
            row.response_time.to_string(),
        ];

        if include_survey {
            record.push(row.age.map(|age| age.to_string()).unwrap_or_default());
            record.push(row.sex.unwrap_or_default());
            record.push(row.race.unwrap_or_default());
        }

        writer.write_record(&record).map_err(export_error)?;
        written += 1;
    }

    info!(rows = written, "CSV export written");

    writer
        .into_inner()
        .map_err(|e| AppError::Internal(format!("Failed to finish CSV export: {}", e)))
}

/// One CSV row per (result set, response). Demographic columns are added
/// when the study's latest configuration collects a survey.
#[instrument(skip(pool))]
pub async fn export_study_csv(
    pool: &Pool<Sqlite>,
    study_id: Uuid,
    caller_id: i64,
) -> Result<Vec<u8>, AppError> {
    ensure_ownership(pool, study_id, caller_id).await?;

    let has_survey: Option<(bool,)> = sqlx::query_as(
        "SELECT cc.has_survey FROM study_configs c
         JOIN conclusion_configs cc ON cc.study_config_id = c.id
         WHERE c.study_id = ?
         ORDER BY c.created_at DESC, c.rowid DESC LIMIT 1",
    )
    .bind(study_id)
    .fetch_optional(pool)
    .await?;

    write_export(
        pool,
        ExportScope::Study(study_id),
        has_survey.is_some_and(|(flag,)| flag),
    )
    .await
}

#[instrument(skip(pool))]
pub async fn export_result_csv(
    pool: &Pool<Sqlite>,
    result_id: Uuid,
    caller_id: i64,
) -> Result<Vec<u8>, AppError> {
    let result = sqlx::query_as::<_, StudyResult>(
        "SELECT id, study_id, config_id, subject_id, submitted FROM study_results WHERE id = ?",
    )
    .bind(result_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Result set {} not found", result_id)))?;

    ensure_ownership(pool, result.study_id, caller_id)
        .await
        .map_err(|_| AppError::NotFound(format!("Result set {} not found", result_id)))?;

    let has_survey: Option<(bool,)> =
        sqlx::query_as("SELECT has_survey FROM conclusion_configs WHERE study_config_id = ?")
            .bind(result.config_id)
            .fetch_optional(pool)
            .await?;

    write_export(
        pool,
        ExportScope::Result(result.id),
        has_survey.is_some_and(|(flag,)| flag),
    )
    .await
}

/// Every response across all of the researcher's studies, with the
/// demographic columns always present.
#[instrument(skip(pool))]
pub async fn export_researcher_csv(
    pool: &Pool<Sqlite>,
    researcher_id: i64,
) -> Result<Vec<u8>, AppError> {
    write_export(pool, ExportScope::Researcher(researcher_id), true).await
}

/// Removes a study and everything hanging off it, children first, in one
/// transaction. Survey answers are keyed by subject and are kept.
#[instrument(skip(pool))]
pub async fn delete_study(
    pool: &Pool<Sqlite>,
    study_id: Uuid,
    caller_id: i64,
) -> Result<(), AppError> {
    ensure_ownership(pool, study_id, caller_id).await?;

    let statements = [
        "DELETE FROM study_responses WHERE result_id IN
            (SELECT id FROM study_results WHERE study_id = ?)",
        "DELETE FROM study_results WHERE study_id = ?",
        "DELETE FROM survey_questions WHERE survey_config_id IN
            (SELECT sc.id FROM survey_configs sc
             JOIN study_configs c ON c.id = sc.study_config_id WHERE c.study_id = ?)",
        "DELETE FROM survey_configs WHERE study_config_id IN
            (SELECT id FROM study_configs WHERE study_id = ?)",
        "DELETE FROM learning_configs WHERE study_config_id IN
            (SELECT id FROM study_configs WHERE study_id = ?)",
        "DELETE FROM wait_configs WHERE study_config_id IN
            (SELECT id FROM study_configs WHERE study_id = ?)",
        "DELETE FROM experiment_configs WHERE study_config_id IN
            (SELECT id FROM study_configs WHERE study_id = ?)",
        "DELETE FROM conclusion_configs WHERE study_config_id IN
            (SELECT id FROM study_configs WHERE study_id = ?)",
        "DELETE FROM uploaded_files WHERE study_config_id IN
            (SELECT id FROM study_configs WHERE study_id = ?)",
        "DELETE FROM study_configs WHERE study_id = ?",
        "DELETE FROM studies WHERE id = ?",
    ];

    let mut tx = begin_write(pool).await?;
    for statement in statements {
        sqlx::query(statement)
            .bind(study_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    info!("Study deleted");
    Ok(())
}

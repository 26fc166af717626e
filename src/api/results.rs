use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Route, State};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::db::{SubmittedResult, record_responses, save_survey_answer, start_result, submit_results};
use crate::error::AppError;
use crate::models::{ResponseSubmission, SubmissionPolicy, SurveyAnswer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultIdentity {
    pub config_id: Uuid,
    pub subject_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultsRequest {
    pub identity: ResultIdentity,
    pub responses: Vec<ResponseSubmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBatch {
    pub responses: Vec<ResponseSubmission>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartedResult {
    pub result_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordedResponses {
    pub result_id: Uuid,
    pub response_count: usize,
}

#[post("/results/responses", data = "<payload>")]
pub async fn api_submit_results(
    payload: Json<SubmitResultsRequest>,
    db: &State<Pool<Sqlite>>,
    policy: &State<SubmissionPolicy>,
) -> Result<Custom<Json<SubmittedResult>>, AppError> {
    let payload = payload.into_inner();

    let submitted = submit_results(
        db,
        payload.identity.config_id,
        &payload.identity.subject_id,
        payload.responses,
        **policy,
    )
    .await?;

    Ok(Custom(Status::Created, Json(submitted)))
}

#[post("/results/start", data = "<identity>")]
pub async fn api_start_result(
    identity: Json<ResultIdentity>,
    db: &State<Pool<Sqlite>>,
    policy: &State<SubmissionPolicy>,
) -> Result<Custom<Json<StartedResult>>, AppError> {
    let result_id = start_result(db, identity.config_id, &identity.subject_id, **policy).await?;
    Ok(Custom(Status::Created, Json(StartedResult { result_id })))
}

#[post("/experiment/responses/<result_id>", data = "<batch>")]
pub async fn api_record_responses(
    result_id: Uuid,
    batch: Json<ResponseBatch>,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<RecordedResponses>>, AppError> {
    let response_count = record_responses(db, result_id, batch.into_inner().responses).await?;
    Ok(Custom(
        Status::Created,
        Json(RecordedResponses {
            result_id,
            response_count,
        }),
    ))
}

#[post("/survey/responses", data = "<answer>")]
pub async fn api_submit_survey(
    answer: Json<SurveyAnswer>,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<SurveyAnswer>>, AppError> {
    let saved = save_survey_answer(db, answer.into_inner()).await?;
    Ok(Custom(Status::Created, Json(saved)))
}

pub fn routes() -> Vec<Route> {
    routes![
        api_submit_results,
        api_start_result,
        api_record_responses,
        api_submit_survey,
    ]
}

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rocket::FromFormField;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, FromFormField)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DisplayMethod {
    Sequential,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, FromFormField)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ResponseMethod {
    Binary,
    Gradient,
}

impl fmt::Display for DisplayMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayMethod::Sequential => write!(f, "sequential"),
            DisplayMethod::Random => write!(f, "random"),
        }
    }
}

impl fmt::Display for ResponseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMethod::Binary => write!(f, "binary"),
            ResponseMethod::Gradient => write!(f, "gradient"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LearningPhase {
    pub display_duration: i64,
    pub pause_duration: i64,
    pub display_method: DisplayMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WaitPhase {
    pub display_duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExperimentPhase {
    pub display_duration: i64,
    pub pause_duration: i64,
    pub display_method: DisplayMethod,
    pub response_method: ResponseMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConclusionPhase {
    pub show_results: bool,
    pub has_survey: bool,
    pub questions: Option<Vec<String>>,
}

/// A named upload held fully in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedDocument {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageList {
    pub filename: String,
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationFiles {
    pub consent_form: UploadedDocument,
    pub study_instructions: UploadedDocument,
    pub study_debrief: Option<UploadedDocument>,
    pub learning_images: ImageList,
    pub experiment_images: ImageList,
}

/// Everything needed to create one configuration version, already parsed.
#[derive(Debug, Clone)]
pub struct NewStudyConfiguration {
    pub learning: LearningPhase,
    pub wait: WaitPhase,
    pub experiment: ExperimentPhase,
    pub conclusion: ConclusionPhase,
    pub files: ConfigurationFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedConfiguration {
    pub study_id: Uuid,
    pub config_id: Uuid,
    pub study_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub consent_form: String,
    pub study_instructions: String,
    pub study_debrief: Option<String>,
    pub learning_list: String,
    pub experiment_list: String,
    pub learning_image_list: Vec<String>,
    pub experiment_image_list: Vec<String>,
}

/// A configuration as served to runtime clients: phases and file names,
/// never the file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyConfigurationView {
    pub config_id: Uuid,
    pub study_id: Uuid,
    pub study_code: String,
    pub learning: LearningPhase,
    pub wait: WaitPhase,
    pub experiment: ExperimentPhase,
    pub conclusion: ConclusionPhase,
    pub files: FileSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePhase {
    Learning,
    Experiment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub image_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum PhaseWithImages {
    Learning {
        config: LearningPhase,
        images: Vec<ImageUrl>,
        expires_at: DateTime<Utc>,
    },
    Experiment {
        config: ExperimentPhase,
        images: Vec<ImageUrl>,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    ConsentForm,
    Instructions,
    Debrief,
}

impl DocumentKind {
    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::ConsentForm => "consent form",
            DocumentKind::Instructions => "study instructions",
            DocumentKind::Debrief => "study debrief",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ResponseSubmission {
    #[validate(length(min = 1, message = "image_id must not be empty"))]
    pub image_id: String,
    pub answer: i64,
    #[validate(custom(function = "validate_response_time"))]
    pub response_time: f64,
}

fn validate_response_time(value: f64) -> Result<(), validator::ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(validator::ValidationError::new("response_time")
            .with_message("response_time must be a non-negative number".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionPolicy {
    pub allow_resubmission: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudyResult {
    pub id: Uuid,
    pub study_id: Uuid,
    pub config_id: Uuid,
    pub subject_id: String,
    pub submitted: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudyResponse {
    pub sequence: i64,
    pub image_id: String,
    pub answer: i64,
    pub response_time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, sqlx::FromRow)]
pub struct SurveyAnswer {
    #[validate(length(min = 1, message = "subject_id must not be empty"))]
    pub subject_id: String,
    #[validate(range(min = 0, max = 150, message = "age must be between 0 and 150"))]
    pub age: i64,
    #[validate(length(min = 1, message = "sex must not be empty"))]
    pub sex: String,
    #[validate(length(min = 1, message = "race must not be empty"))]
    pub race: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudyListItem {
    pub study_id: Uuid,
    pub configuration_id: Option<Uuid>,
    pub study_code: Option<String>,
    pub total_submissions: i64,
    pub expected_items: i64,
    pub last_submission_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub study_id: Uuid,
    pub total_submissions: i64,
    pub expected_items: i64,
    pub complete_submissions: i64,
    pub completion_rate: f64,
    pub avg_response_time: Option<f64>,
    pub answer_histogram: BTreeMap<i64, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub study_results_id: Uuid,
    pub subject_id: String,
    pub config_id: Uuid,
    pub submitted: DateTime<Utc>,
    pub is_complete: bool,
    pub responses: Vec<StudyResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResults {
    pub items: Vec<ResultRow>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}

use rocket::FromForm;
use rocket::fs::TempFile;
use rocket::tokio::io::AsyncReadExt;
use tracing::instrument;
use validator::Validate;

use crate::error::AppError;
use crate::models::{
    ConclusionPhase, ConfigurationFiles, DisplayMethod, ExperimentPhase, ImageList, LearningPhase,
    NewStudyConfiguration, ResponseMethod, UploadedDocument, WaitPhase,
};
use crate::storage::sanitize_filename;
use crate::validation::validated;

const IMAGE_LIST_HEADERS: [&str; 4] = ["image_id", "image", "filename", "id"];

#[derive(FromForm, Validate)]
pub struct LearningForm {
    #[field(name = "displayDuration")]
    #[validate(range(min = 0, message = "learning.displayDuration must be non-negative"))]
    pub display_duration: i64,
    #[field(name = "pauseDuration")]
    #[validate(range(min = 0, message = "learning.pauseDuration must be non-negative"))]
    pub pause_duration: i64,
    #[field(name = "displayMethod")]
    pub display_method: DisplayMethod,
}

#[derive(FromForm, Validate)]
pub struct WaitForm {
    #[field(name = "displayDuration")]
    #[validate(range(min = 0, message = "waiting.displayDuration must be non-negative"))]
    pub display_duration: i64,
}

#[derive(FromForm, Validate)]
pub struct ExperimentForm {
    #[field(name = "displayDuration")]
    #[validate(range(min = 0, message = "experiment.displayDuration must be non-negative"))]
    pub display_duration: i64,
    #[field(name = "pauseDuration")]
    #[validate(range(min = 0, message = "experiment.pauseDuration must be non-negative"))]
    pub pause_duration: i64,
    #[field(name = "displayMethod")]
    pub display_method: DisplayMethod,
    #[field(name = "responseMethod")]
    pub response_method: ResponseMethod,
}

#[derive(FromForm)]
pub struct ConclusionForm {
    #[field(name = "showResults", default = false)]
    pub show_results: bool,
    #[field(name = "survey", default = false)]
    pub has_survey: bool,
    #[field(name = "questions")]
    pub questions: Vec<String>,
}

#[derive(FromForm)]
pub struct ConfigFilesForm<'r> {
    #[field(name = "consentForm")]
    pub consent_form: TempFile<'r>,
    #[field(name = "studyInstructions")]
    pub study_instructions: TempFile<'r>,
    #[field(name = "learningList")]
    pub learning_list: TempFile<'r>,
    #[field(name = "experimentList")]
    pub experiment_list: TempFile<'r>,
    #[field(name = "studyDebrief")]
    pub study_debrief: Option<TempFile<'r>>,
}

/// The multipart body posted by the configuration builder.
#[derive(FromForm)]
pub struct StudyConfigurationForm<'r> {
    pub learning: LearningForm,
    #[field(name = "waiting")]
    pub wait: WaitForm,
    pub experiment: ExperimentForm,
    pub conclusion: ConclusionForm,
    #[field(name = "configFiles")]
    pub config_files: ConfigFilesForm<'r>,
}

impl StudyConfigurationForm<'_> {
    #[instrument(skip(self))]
    pub async fn into_new_configuration(self) -> Result<NewStudyConfiguration, AppError> {
        let learning = validated(self.learning)?;
        let wait = validated(self.wait)?;
        let experiment = validated(self.experiment)?;
        let files = self.config_files;

        let consent_form = read_document(&files.consent_form, "consentForm").await?;
        let study_instructions =
            read_document(&files.study_instructions, "studyInstructions").await?;

        let study_debrief = match &files.study_debrief {
            Some(file) if file.len() > 0 => Some(read_document(file, "studyDebrief").await?),
            _ => None,
        };

        let learning_list = read_document(&files.learning_list, "learningList").await?;
        let experiment_list = read_document(&files.experiment_list, "experimentList").await?;

        let questions = clean_questions(self.conclusion.questions);
        let conclusion = ConclusionPhase {
            show_results: self.conclusion.show_results,
            has_survey: self.conclusion.has_survey,
            questions: if self.conclusion.has_survey {
                Some(questions)
            } else {
                None
            },
        };

        Ok(NewStudyConfiguration {
            learning: LearningPhase {
                display_duration: learning.display_duration,
                pause_duration: learning.pause_duration,
                display_method: learning.display_method,
            },
            wait: WaitPhase {
                display_duration: wait.display_duration,
            },
            experiment: ExperimentPhase {
                display_duration: experiment.display_duration,
                pause_duration: experiment.pause_duration,
                display_method: experiment.display_method,
                response_method: experiment.response_method,
            },
            conclusion,
            files: ConfigurationFiles {
                consent_form,
                study_instructions,
                study_debrief,
                learning_images: parse_image_list(&learning_list.filename, &learning_list.bytes)?,
                experiment_images: parse_image_list(
                    &experiment_list.filename,
                    &experiment_list.bytes,
                )?,
            },
        })
    }
}

fn clean_questions(questions: Vec<String>) -> Vec<String> {
    questions
        .into_iter()
        .map(|question| question.trim().to_string())
        .filter(|question| !question.is_empty())
        .collect()
}

pub fn uploaded_filename(file: &TempFile<'_>, fallback: &str) -> String {
    let raw = file
        .raw_name()
        .map(|name| name.dangerous_unsafe_unsanitized_raw().as_str().to_string())
        .unwrap_or_default();

    let name = sanitize_filename(&raw);
    if name.is_empty() {
        fallback.to_string()
    } else {
        name
    }
}

pub async fn read_upload(file: &TempFile<'_>) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::with_capacity(file.len() as usize);
    let reader = file.open().await?;
    rocket::tokio::pin!(reader);
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

async fn read_document(file: &TempFile<'_>, field: &str) -> Result<UploadedDocument, AppError> {
    let bytes = read_upload(file).await?;
    if bytes.is_empty() {
        return Err(AppError::Validation(format!(
            "configFiles.{} must not be empty",
            field
        )));
    }

    Ok(UploadedDocument {
        filename: uploaded_filename(file, field),
        bytes,
    })
}

/// Reads an image-id list from CSV bytes: the first column of every row,
/// trimmed, with blank rows and a single leading header row dropped.
pub fn parse_image_list(filename: &str, bytes: &[u8]) -> Result<ImageList, AppError> {
    let text = std::str::from_utf8(bytes).map_err(|_| {
        AppError::Validation(format!("Image list {} is not valid UTF-8", filename))
    })?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut image_ids = Vec::new();
    let mut first_row = true;

    for record in reader.records() {
        let record = record?;
        let value = record.get(0).unwrap_or_default().trim();
        if value.is_empty() {
            continue;
        }

        if first_row
            && IMAGE_LIST_HEADERS
                .iter()
                .any(|header| header.eq_ignore_ascii_case(value))
        {
            first_row = false;
            continue;
        }

        first_row = false;
        image_ids.push(value.to_string());
    }

    if image_ids.is_empty() {
        return Err(AppError::Validation(format!(
            "Image list {} contains no image ids",
            filename
        )));
    }

    Ok(ImageList {
        filename: filename.to_string(),
        image_ids,
    })
}

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Route, State};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use crate::auth::{Permission, User};
use crate::env::Settings;
use crate::error::AppError;
use crate::forms::{read_upload, uploaded_filename};
use crate::storage::{
    ObjectStore, UploadManifest, UploadedPart, content_type_for, sanitize_filename,
    staging_key, staging_prefix,
};
use crate::validation::JsonValidateExt;

use super::MessageResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
}

#[derive(FromForm)]
pub struct ImageUpload<'r> {
    pub file: TempFile<'r>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateMultipartRequest {
    #[validate(length(min = 1, max = 255, message = "filename must be 1-255 characters"))]
    pub filename: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartCreated {
    pub upload_id: String,
    pub key: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignPartRequest {
    #[validate(length(min = 1, max = 255, message = "filename must be 1-255 characters"))]
    pub filename: String,
    #[validate(length(min = 1, message = "uploadId is required"))]
    pub upload_id: String,
    #[validate(range(min = 1, max = 10000, message = "partNumber must be between 1 and 10000"))]
    pub part_number: i32,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest {
    #[validate(length(min = 1, max = 255, message = "filename must be 1-255 characters"))]
    pub filename: String,
    #[validate(length(min = 1, message = "uploadId is required"))]
    pub upload_id: String,
    #[validate(length(min = 1, message = "at least one part is required"))]
    pub parts: Vec<UploadedPart>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AbortMultipartRequest {
    #[validate(length(min = 1, max = 255, message = "filename must be 1-255 characters"))]
    pub filename: String,
    #[validate(length(min = 1, message = "uploadId is required"))]
    pub upload_id: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    #[validate(length(min = 1, message = "at least one filename is required"))]
    pub filenames: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedManifest {
    pub key: String,
    pub manifest: UploadManifest,
}

fn expiry_timestamp(settings: &Settings) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(settings.storage.presigned_url_expiry_secs as i64)
}

#[get("/images/url?<filename>")]
pub async fn api_image_url(
    filename: &str,
    store: &State<Arc<dyn ObjectStore>>,
    settings: &State<Settings>,
) -> Result<Json<PresignedUrl>, AppError> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(AppError::Validation("filename is required".to_string()));
    }

    let url = store
        .presign_get(filename, settings.storage.presigned_url_expiry())
        .await?;

    Ok(Json(PresignedUrl {
        url,
        expires_at: expiry_timestamp(settings),
    }))
}

#[post("/images/upload", data = "<upload>")]
pub async fn api_upload_image(
    upload: Form<ImageUpload<'_>>,
    user: User,
    store: &State<Arc<dyn ObjectStore>>,
) -> Result<Custom<Json<StoredObject>>, AppError> {
    user.require_permission(Permission::ManageImages)?;

    let key = uploaded_filename(&upload.file, "");
    if key.is_empty() {
        return Err(AppError::Validation("file must have a filename".to_string()));
    }

    let bytes = read_upload(&upload.file).await?;
    store.put_object(&key, bytes, content_type_for(&key)).await?;

    info!(user_id = user.id, key = %key, "Image uploaded");
    Ok(Custom(Status::Created, Json(StoredObject { key })))
}

#[delete("/images/<path..>")]
pub async fn api_delete_image(
    path: PathBuf,
    user: User,
    store: &State<Arc<dyn ObjectStore>>,
) -> Result<Json<MessageResponse>, AppError> {
    user.require_permission(Permission::ManageImages)?;

    let key = path
        .iter()
        .map(|segment| segment.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    if key.is_empty() {
        return Err(AppError::Validation("object key is required".to_string()));
    }

    // Staging objects may only be removed by the user that uploaded them.
    // Anything outside staging can be referenced by any study.
    if key.starts_with("staging/") {
        if !key.starts_with(&format!("staging/{}/", user.id)) {
            return Err(AppError::NotFound(format!("Object {} not found", key)));
        }
    } else {
        user.require_permission(Permission::DeleteSharedImages)?;
    }

    store.delete_object(&key).await?;
    info!(user_id = user.id, key = %key, "Object deleted");
    Ok(MessageResponse::new("Object deleted"))
}

#[post("/uploads/<session_id>/multipart", data = "<request>")]
pub async fn api_create_multipart(
    session_id: &str,
    request: Json<CreateMultipartRequest>,
    user: User,
    store: &State<Arc<dyn ObjectStore>>,
) -> Result<Custom<Json<MultipartCreated>>, AppError> {
    user.require_permission(Permission::ManageImages)?;
    let request = request.validate_custom()?;

    let key = staging_key(user.id, session_id, &request.filename)?;
    let content_type = request
        .content_type
        .as_deref()
        .unwrap_or_else(|| content_type_for(&request.filename));

    let upload_id = store.create_multipart_upload(&key, content_type).await?;

    Ok(Custom(
        Status::Created,
        Json(MultipartCreated { upload_id, key }),
    ))
}

#[post("/uploads/<session_id>/sign-part", data = "<request>")]
pub async fn api_sign_part(
    session_id: &str,
    request: Json<SignPartRequest>,
    user: User,
    store: &State<Arc<dyn ObjectStore>>,
    settings: &State<Settings>,
) -> Result<Json<PresignedUrl>, AppError> {
    user.require_permission(Permission::ManageImages)?;
    let request = request.validate_custom()?;

    let key = staging_key(user.id, session_id, &request.filename)?;
    let url = store
        .presign_upload_part(
            &key,
            &request.upload_id,
            request.part_number,
            settings.storage.presigned_url_expiry(),
        )
        .await?;

    Ok(Json(PresignedUrl {
        url,
        expires_at: expiry_timestamp(settings),
    }))
}

#[post("/uploads/<session_id>/complete", data = "<request>")]
pub async fn api_complete_multipart(
    session_id: &str,
    request: Json<CompleteMultipartRequest>,
    user: User,
    store: &State<Arc<dyn ObjectStore>>,
) -> Result<Json<StoredObject>, AppError> {
    user.require_permission(Permission::ManageImages)?;
    let mut request = request.validate_custom()?;

    let key = staging_key(user.id, session_id, &request.filename)?;
    request.parts.sort_by_key(|part| part.part_number);

    store
        .complete_multipart_upload(&key, &request.upload_id, &request.parts)
        .await?;

    info!(user_id = user.id, key = %key, parts = request.parts.len(), "Multipart upload completed");
    Ok(Json(StoredObject { key }))
}

#[post("/uploads/<session_id>/abort", data = "<request>")]
pub async fn api_abort_multipart(
    session_id: &str,
    request: Json<AbortMultipartRequest>,
    user: User,
    store: &State<Arc<dyn ObjectStore>>,
) -> Result<Json<MessageResponse>, AppError> {
    user.require_permission(Permission::ManageImages)?;
    let request = request.validate_custom()?;

    let key = staging_key(user.id, session_id, &request.filename)?;
    store
        .abort_multipart_upload(&key, &request.upload_id)
        .await?;

    Ok(MessageResponse::new("Multipart upload aborted"))
}

#[post("/uploads/<session_id>/commit", data = "<request>")]
pub async fn api_commit_uploads(
    session_id: &str,
    request: Json<CommitRequest>,
    user: User,
    store: &State<Arc<dyn ObjectStore>>,
) -> Result<Custom<Json<CommittedManifest>>, AppError> {
    user.require_permission(Permission::ManageImages)?;
    let request = request.validate_custom()?;

    staging_prefix(user.id, session_id)?;
    let filenames: Vec<String> = request
        .filenames
        .iter()
        .map(|name| sanitize_filename(name))
        .collect();

    let manifest = UploadManifest::new(user.id, session_id, &filenames)?;
    let key = manifest.write(store.inner().as_ref()).await?;

    Ok(Custom(
        Status::Created,
        Json(CommittedManifest { key, manifest }),
    ))
}

pub fn routes() -> Vec<Route> {
    routes![
        api_image_url,
        api_upload_image,
        api_delete_image,
        api_create_multipart,
        api_sign_part,
        api_complete_multipart,
        api_abort_multipart,
        api_commit_uploads,
    ]
}

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::env::{StorageCredentials, StorageSettings};
use crate::error::AppError;

pub const MANIFEST_VERSION: u32 = 1;
const STAGING_ROOT: &str = "staging";
const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// The operations the service needs from an S3-compatible bucket. Every
/// failure surfaces as `AppError::ExternalService`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<String, AppError>;

    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), AppError>;

    async fn delete_object(&self, key: &str) -> Result<(), AppError>;

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, AppError>;

    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expiry: Duration,
    ) -> Result<String, AppError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), AppError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), AppError>;
}

/// Two clients against the same bucket: presigned reads are signed with
/// the read-only key pair, writes go through the read-write pair.
pub struct S3Storage {
    read_client: S3Client,
    rw_client: S3Client,
    bucket: String,
}

async fn build_client(settings: &StorageSettings, credentials: Option<&StorageCredentials>) -> S3Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(settings.region.clone()));

    if let Some(credentials) = credentials {
        loader = loader.credentials_provider(Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            "study-server-settings",
        ));
    }

    let aws_config = loader.load().await;
    let mut builder = S3ConfigBuilder::from(&aws_config);

    if let Some(endpoint_url) = &settings.endpoint_url {
        builder = builder.endpoint_url(endpoint_url);
    }

    if settings.force_path_style {
        builder = builder.force_path_style(true);
    }

    S3Client::from_conf(builder.build())
}

fn external<E: std::error::Error>(context: &str, err: E) -> AppError {
    AppError::ExternalService(format!("{}: {}", context, DisplayErrorContext(err)))
}

fn presigning(expiry: Duration) -> Result<PresigningConfig, AppError> {
    PresigningConfig::expires_in(expiry)
        .map_err(|e| AppError::Internal(format!("Invalid presigned URL expiry: {}", e)))
}

impl S3Storage {
    pub async fn new(settings: &StorageSettings) -> Self {
        let read_credentials = settings
            .read_credentials
            .as_ref()
            .or(settings.rw_credentials.as_ref());

        let read_client = build_client(settings, read_credentials).await;
        let rw_client = build_client(settings, settings.rw_credentials.as_ref()).await;

        info!(
            bucket = %settings.bucket,
            region = %settings.region,
            endpoint = ?settings.endpoint_url,
            "Object storage initialized"
        );

        Self {
            read_client,
            rw_client,
            bucket: settings.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    #[instrument(skip(self))]
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<String, AppError> {
        let presigned = self
            .read_client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning(expiry)?)
            .await
            .map_err(|e| external("Failed to presign object download", e))?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), AppError> {
        self.rw_client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| external("Failed to upload object", e))?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<(), AppError> {
        self.rw_client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| external("Failed to delete object", e))?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, AppError> {
        let response = self
            .rw_client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| external("Failed to create multipart upload", e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::ExternalService("No upload ID in response".to_string()))
    }

    #[instrument(skip(self))]
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expiry: Duration,
    ) -> Result<String, AppError> {
        let presigned = self
            .rw_client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presigning(expiry)?)
            .await
            .map_err(|e| external("Failed to presign upload part", e))?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self, parts), fields(part_count = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), AppError> {
        let completed_parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.e_tag)
                    .build()
            })
            .collect();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.rw_client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| external("Failed to complete multipart upload", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), AppError> {
        self.rw_client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| external("Failed to abort multipart upload", e))?;

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub key: String,
    pub filename: String,
}

/// Record written to `staging/{user}/{session}/manifest.json` once a
/// client has finished uploading a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub user_id: i64,
    pub session_id: String,
    pub items: Vec<ManifestItem>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

pub fn sanitize_filename(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

pub fn validate_session_id(session_id: &str) -> Result<(), AppError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(
            "session_id must be 1-64 characters of letters, digits, '-' or '_'".to_string(),
        ))
    }
}

pub fn staging_prefix(user_id: i64, session_id: &str) -> Result<String, AppError> {
    validate_session_id(session_id)?;
    Ok(format!("{}/{}/{}/", STAGING_ROOT, user_id, session_id))
}

pub fn staging_key(user_id: i64, session_id: &str, filename: &str) -> Result<String, AppError> {
    let name = sanitize_filename(filename);
    if name.is_empty() || name.chars().all(|c| c == '.') || name == MANIFEST_NAME {
        return Err(AppError::Validation(format!(
            "Invalid upload filename: {}",
            filename
        )));
    }

    Ok(format!("{}{}", staging_prefix(user_id, session_id)?, name))
}

pub fn content_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

impl UploadManifest {
    pub fn new(user_id: i64, session_id: &str, filenames: &[String]) -> Result<Self, AppError> {
        if filenames.is_empty() {
            return Err(AppError::Validation(
                "A manifest needs at least one item".to_string(),
            ));
        }

        let items = filenames
            .iter()
            .map(|filename| {
                Ok(ManifestItem {
                    key: staging_key(user_id, session_id, filename)?,
                    filename: sanitize_filename(filename),
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        Ok(Self {
            user_id,
            session_id: session_id.to_string(),
            items,
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
        })
    }

    pub fn key(&self) -> Result<String, AppError> {
        Ok(format!(
            "{}{}",
            staging_prefix(self.user_id, &self.session_id)?,
            MANIFEST_NAME
        ))
    }

    #[instrument(skip(self, store), fields(user_id = self.user_id, session_id = %self.session_id))]
    pub async fn write(&self, store: &dyn ObjectStore) -> Result<String, AppError> {
        let key = self.key()?;
        let body = serde_json::to_vec(self)?;

        store.put_object(&key, body, "application/json").await?;
        info!(key = %key, items = self.items.len(), "Upload manifest committed");

        Ok(key)
    }
}

#[cfg(test)]
pub mod test_db {
    use crate::auth::Role;
    use crate::db::{connect_options, create_configuration, create_user};
    use crate::error::AppError;
    use crate::models::{
        ConclusionPhase, ConfigurationFiles, CreatedConfiguration, DisplayMethod,
        ExperimentPhase, ImageList, LearningPhase, NewStudyConfiguration, ResponseMethod,
        UploadedDocument, WaitPhase,
    };
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::{Pool, Sqlite};
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Once;
    use tempfile::TempDir;
    use tracing::log::LevelFilter;

    static INIT: Once = Once::new();
    pub static STANDARD_PASSWORD: &str = "password123";

    #[derive(Default)]
    pub struct TestDbBuilder {
        users: Vec<TestUser>,
    }

    pub struct TestUser {
        pub email: String,
        pub display_name: Option<String>,
        pub role: Role,
        pub password: String,
    }

    impl TestDbBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        fn user(mut self, email: &str, role: Role) -> Self {
            self.users.push(TestUser {
                email: email.to_string(),
                display_name: None,
                role,
                password: STANDARD_PASSWORD.to_string(),
            });
            self
        }

        pub fn researcher(self, email: &str) -> Self {
            self.user(email, Role::Researcher)
        }

        pub fn staff(self, email: &str) -> Self {
            self.user(email, Role::Staff)
        }

        pub fn admin(self, email: &str) -> Self {
            self.user(email, Role::Admin)
        }

        pub fn user_with_password(
            mut self,
            email: &str,
            display_name: Option<&str>,
            role: Role,
            password: &str,
        ) -> Self {
            self.users.push(TestUser {
                email: email.to_string(),
                display_name: display_name.map(String::from),
                role,
                password: password.to_string(),
            });
            self
        }

        pub async fn build(self) -> Result<TestDb, AppError> {
            let pool = memory_pool().await?;
            self.build_on(pool).await
        }

        /// Migrates and seeds an existing pool, such as one from [`file_pool`].
        pub async fn build_on(self, pool: Pool<Sqlite>) -> Result<TestDb, AppError> {
            INIT.call_once(|| {
                let _ = env_logger::builder()
                    .filter_level(LevelFilter::Debug)
                    .is_test(true)
                    .try_init();
            });

            sqlx::migrate!("./migrations").run(&pool).await?;

            let mut user_id_map: HashMap<String, i64> = HashMap::new();
            for user in &self.users {
                let user_id = create_user(
                    &pool,
                    &user.email,
                    &user.password,
                    user.role,
                    user.display_name.as_deref(),
                )
                .await?;

                user_id_map.insert(user.email.clone(), user_id);
            }

            Ok(TestDb { pool, user_id_map })
        }
    }

    /// An in-memory database lives only as long as its connection, so the
    /// pool is pinned to a single connection that never expires.
    pub async fn memory_pool() -> Result<Pool<Sqlite>, AppError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(pool)
    }

    /// A database file with the server's connection options and several
    /// connections, for tests that need real concurrent writers.
    pub async fn file_pool(dir: &TempDir, max_connections: u32) -> Result<Pool<Sqlite>, AppError> {
        let path = dir.path().join("study.db");
        let options = connect_options(&format!("sqlite://{}", path.display()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(pool)
    }

    pub struct TestDb {
        pub pool: Pool<Sqlite>,
        pub user_id_map: HashMap<String, i64>,
    }

    impl TestDb {
        pub fn user_id(&self, email: &str) -> Option<i64> {
            self.user_id_map.get(email).copied()
        }

        pub async fn create_study(
            &self,
            owner_email: &str,
            config: NewStudyConfiguration,
        ) -> Result<CreatedConfiguration, AppError> {
            let owner_id = self.user_id(owner_email).ok_or_else(|| {
                AppError::NotFound(format!("Test user {} not registered", owner_email))
            })?;

            create_configuration(&self.pool, owner_id, config).await
        }
    }

    pub fn document(filename: &str, contents: &str) -> UploadedDocument {
        UploadedDocument {
            filename: filename.to_string(),
            bytes: contents.as_bytes().to_vec(),
        }
    }

    /// A complete configuration with three learning images and the given
    /// experiment images.
    pub fn sample_configuration(
        experiment_images: &[&str],
        questions: Option<&[&str]>,
    ) -> NewStudyConfiguration {
        NewStudyConfiguration {
            learning: LearningPhase {
                display_duration: 3,
                pause_duration: 1,
                display_method: DisplayMethod::Sequential,
            },
            wait: WaitPhase {
                display_duration: 30,
            },
            experiment: ExperimentPhase {
                display_duration: 2,
                pause_duration: 1,
                display_method: DisplayMethod::Random,
                response_method: ResponseMethod::Binary,
            },
            conclusion: ConclusionPhase {
                show_results: true,
                has_survey: questions.is_some(),
                questions: questions
                    .map(|questions| questions.iter().map(|q| q.to_string()).collect()),
            },
            files: ConfigurationFiles {
                consent_form: document("consent.pdf", "%PDF-1.4 consent"),
                study_instructions: document("instructions.txt", "Look at each face."),
                study_debrief: Some(document("debrief.txt", "Thank you.")),
                learning_images: ImageList {
                    filename: "learning.csv".to_string(),
                    image_ids: vec![
                        "faces/a.jpg".to_string(),
                        "faces/b.jpg".to_string(),
                        "faces/c.jpg".to_string(),
                    ],
                },
                experiment_images: ImageList {
                    filename: "experiment.csv".to_string(),
                    image_ids: experiment_images.iter().map(|id| id.to_string()).collect(),
                },
            },
        }
    }

    pub async fn create_standard_test_db() -> TestDb {
        TestDbBuilder::new()
            .researcher("researcher@example.com")
            .researcher("other@example.com")
            .staff("staff@example.com")
            .admin("admin@example.com")
            .build()
            .await
            .expect("Failed to build standard test database")
    }
}

#[cfg(test)]
pub mod test_store {
    use crate::error::AppError;
    use crate::storage::{ObjectStore, UploadedPart};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    pub struct StoredObject {
        pub bytes: Vec<u8>,
        pub content_type: String,
    }

    /// Bucket stand-in that keeps objects in memory and hands out
    /// deterministic `memory://` URLs.
    #[derive(Default)]
    pub struct MemoryStore {
        pub objects: Mutex<HashMap<String, StoredObject>>,
        pub uploads: Mutex<HashMap<String, String>>,
        pub fail: bool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn object(&self, key: &str) -> Option<StoredObject> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        fn check(&self) -> Result<(), AppError> {
            if self.fail {
                Err(AppError::ExternalService(
                    "memory store unavailable".to_string(),
                ))
            } else {
                Ok(())
            }
        }

        fn check_upload(&self, key: &str, upload_id: &str) -> Result<(), AppError> {
            match self.uploads.lock().unwrap().get(upload_id) {
                Some(upload_key) if upload_key == key => Ok(()),
                _ => Err(AppError::ExternalService(format!(
                    "no upload {} for {}",
                    upload_id, key
                ))),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn presign_get(&self, key: &str, expiry: Duration) -> Result<String, AppError> {
            self.check()?;
            Ok(format!("memory://{}?expires={}", key, expiry.as_secs()))
        }

        async fn put_object(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<(), AppError> {
            self.check()?;
            self.objects.lock().unwrap().insert(
                key.to_string(),
                StoredObject {
                    bytes,
                    content_type: content_type.to_string(),
                },
            );
            Ok(())
        }

        async fn delete_object(&self, key: &str) -> Result<(), AppError> {
            self.check()?;
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        async fn create_multipart_upload(
            &self,
            key: &str,
            _content_type: &str,
        ) -> Result<String, AppError> {
            self.check()?;
            let upload_id = Uuid::new_v4().simple().to_string();
            self.uploads
                .lock()
                .unwrap()
                .insert(upload_id.clone(), key.to_string());
            Ok(upload_id)
        }

        async fn presign_upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            expiry: Duration,
        ) -> Result<String, AppError> {
            self.check()?;
            self.check_upload(key, upload_id)?;
            Ok(format!(
                "memory://{}?uploadId={}&partNumber={}&expires={}",
                key,
                upload_id,
                part_number,
                expiry.as_secs()
            ))
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[UploadedPart],
        ) -> Result<(), AppError> {
            self.check()?;
            self.check_upload(key, upload_id)?;
            self.uploads.lock().unwrap().remove(upload_id);

            let body = parts
                .iter()
                .map(|part| part.e_tag.as_str())
                .collect::<Vec<_>>()
                .join(",");
            self.objects.lock().unwrap().insert(
                key.to_string(),
                StoredObject {
                    bytes: body.into_bytes(),
                    content_type: "application/octet-stream".to_string(),
                },
            );
            Ok(())
        }

        async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), AppError> {
            self.check()?;
            self.check_upload(key, upload_id)?;
            self.uploads.lock().unwrap().remove(upload_id);
            Ok(())
        }
    }
}

#[cfg(test)]
pub mod test_utils {
    pub use super::test_db::*;
    use super::test_store::MemoryStore;
    use crate::env::{Settings, StorageSettings};
    use crate::init_rocket;
    use crate::storage::ObjectStore;
    use rocket::http::{ContentType, Header, Status};
    use rocket::local::asynchronous::Client;
    use serde_json::json;
    use std::sync::Arc;

    pub const BOUNDARY: &str = "X-STUDY-SERVER-BOUNDARY";

    pub fn test_settings() -> Settings {
        Settings {
            database_url: "sqlite::memory:".to_string(),
            storage: StorageSettings {
                bucket: "test-bucket".to_string(),
                endpoint_url: None,
                region: "auto".to_string(),
                read_credentials: None,
                rw_credentials: None,
                force_path_style: true,
                presigned_url_expiry_secs: 600,
            },
            auth_secret: None,
            bootstrap_admin: None,
            allow_resubmission: false,
            session_ttl_hours: 12,
        }
    }

    pub async fn setup_test_client(test_db: TestDb) -> (Client, Arc<MemoryStore>) {
        setup_test_client_with(test_db, test_settings()).await
    }

    pub async fn setup_test_client_with(
        test_db: TestDb,
        settings: Settings,
    ) -> (Client, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn ObjectStore> = memory.clone();

        let rocket = init_rocket(test_db.pool, settings, store, None).await;
        let client = Client::untracked(rocket)
            .await
            .expect("Failed to build Rocket client");

        (client, memory)
    }

    /// Logs in and returns the bearer header for later requests.
    pub async fn login_test_user(client: &Client, email: &str, password: &str) -> Header<'static> {
        let response = client
            .post("/api/auth/login")
            .header(ContentType::JSON)
            .body(json!({ "email": email, "password": password }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok, "login failed for {}", email);

        let body: serde_json::Value = response.into_json().await.expect("login body");
        let token = body["token"].as_str().expect("token in login body");
        Header::new("Authorization", format!("Bearer {}", token))
    }

    pub enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a str),
    }

    pub fn multipart_body(parts: &[Part<'_>]) -> String {
        let mut body = String::new();

        for part in parts {
            body.push_str(&format!("--{}\r\n", BOUNDARY));
            match part {
                Part::Text(name, value) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                        name, value
                    ));
                }
                Part::File(name, filename, contents) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n{}\r\n",
                        name, filename, contents
                    ));
                }
            }
        }

        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        body
    }

    pub fn multipart_content_type() -> ContentType {
        ContentType::new("multipart", "form-data").with_params(("boundary", BOUNDARY))
    }

    /// The multipart body the configuration builder sends for a study with
    /// a two-question survey and two experiment images.
    pub fn configuration_form() -> String {
        multipart_body(&[
            Part::Text("learning.displayDuration", "3"),
            Part::Text("learning.pauseDuration", "1"),
            Part::Text("learning.displayMethod", "sequential"),
            Part::Text("waiting.displayDuration", "30"),
            Part::Text("experiment.displayDuration", "2"),
            Part::Text("experiment.pauseDuration", "1"),
            Part::Text("experiment.displayMethod", "random"),
            Part::Text("experiment.responseMethod", "gradient"),
            Part::Text("conclusion.showResults", "true"),
            Part::Text("conclusion.survey", "true"),
            Part::Text("conclusion.questions", "How old are you?"),
            Part::Text("conclusion.questions", "  "),
            Part::Text("conclusion.questions", "Did you recognise anyone?"),
            Part::File("configFiles.consentForm", "consent.pdf", "%PDF-1.4 consent"),
            Part::File(
                "configFiles.studyInstructions",
                "instructions.txt",
                "Look at each face.",
            ),
            Part::File(
                "configFiles.learningList",
                "learning.csv",
                "image_id\nfaces/a.jpg\nfaces/b.jpg\n",
            ),
            Part::File(
                "configFiles.experimentList",
                "experiment.csv",
                "faces/a.jpg\nfaces/z.jpg\n",
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{
        get_configuration, get_configuration_by_code, get_document, get_phase_with_images,
        list_configuration_ids, normalize_study_code, resolve_study_code,
    };
    use crate::error::AppError;
    use crate::models::{DocumentKind, ImagePhase, PhaseWithImages};
    use crate::test::test_db::{create_standard_test_db, sample_configuration};
    use crate::test::test_store::MemoryStore;
    use rocket::tokio;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_normalize_study_code() {
        assert_eq!(normalize_study_code("  ABC123 ").unwrap(), "abc123");
        assert!(matches!(
            normalize_study_code("abc12"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            normalize_study_code("ghijkl"),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_study_code() {
        let test_db = create_standard_test_db().await;
        let created = test_db
            .create_study(
                "researcher@example.com",
                sample_configuration(&["faces/a.jpg"], None),
            )
            .await
            .unwrap();

        let resolved = resolve_study_code(&test_db.pool, &created.study_code.to_uppercase())
            .await
            .expect("Code should resolve case-insensitively");
        assert_eq!(resolved, created.config_id);

        let unused = if created.study_code == "000000" {
            "ffffff"
        } else {
            "000000"
        };
        assert!(matches!(
            resolve_study_code(&test_db.pool, unused).await,
            Err(AppError::NotFound(_))
        ));

        let view = get_configuration_by_code(&test_db.pool, &created.study_code)
            .await
            .unwrap();
        assert_eq!(view.config_id, created.config_id);
    }

    #[tokio::test]
    async fn test_list_configuration_ids_in_creation_order() {
        let test_db = create_standard_test_db().await;
        assert!(list_configuration_ids(&test_db.pool).await.unwrap().is_empty());

        let first = test_db
            .create_study("researcher@example.com", sample_configuration(&["a"], None))
            .await
            .unwrap();
        let second = test_db
            .create_study("other@example.com", sample_configuration(&["b"], None))
            .await
            .unwrap();

        let ids = list_configuration_ids(&test_db.pool).await.unwrap();
        assert_eq!(ids, vec![first.config_id, second.config_id]);
    }

    #[tokio::test]
    async fn test_get_configuration_errors() {
        let test_db = create_standard_test_db().await;

        assert!(matches!(
            get_configuration(&test_db.pool, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));

        let created = test_db
            .create_study("researcher@example.com", sample_configuration(&["a"], None))
            .await
            .unwrap();

        sqlx::query("DELETE FROM wait_configs WHERE study_config_id = ?")
            .bind(created.config_id)
            .execute(&test_db.pool)
            .await
            .unwrap();

        match get_configuration(&test_db.pool, created.config_id).await {
            Err(AppError::Internal(message)) => {
                assert_eq!(message, "Missing phase configuration.")
            }
            other => panic!("Expected internal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_phase_images_are_presigned_in_upload_order() {
        let test_db = create_standard_test_db().await;
        let store = MemoryStore::new();
        let created = test_db
            .create_study(
                "researcher@example.com",
                sample_configuration(&["faces/z.jpg", "faces/a.jpg"], None),
            )
            .await
            .unwrap();

        let phase = get_phase_with_images(
            &test_db.pool,
            &store,
            created.config_id,
            ImagePhase::Experiment,
            Duration::from_secs(600),
        )
        .await
        .expect("Failed to presign experiment images");

        match phase {
            PhaseWithImages::Experiment { config, images, .. } => {
                assert_eq!(config.display_duration, 2);
                let ids: Vec<&str> = images.iter().map(|i| i.image_id.as_str()).collect();
                assert_eq!(ids, vec!["faces/z.jpg", "faces/a.jpg"]);
                assert_eq!(images[0].url, "memory://faces/z.jpg?expires=600");
            }
            other => panic!("Expected experiment phase, got {:?}", other),
        }

        let learning = get_phase_with_images(
            &test_db.pool,
            &store,
            created.config_id,
            ImagePhase::Learning,
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(matches!(
            learning,
            PhaseWithImages::Learning { ref images, .. } if images.len() == 3
        ));
    }

    #[tokio::test]
    async fn test_phase_images_surface_storage_failures() {
        let test_db = create_standard_test_db().await;
        let created = test_db
            .create_study("researcher@example.com", sample_configuration(&["a"], None))
            .await
            .unwrap();

        let result = get_phase_with_images(
            &test_db.pool,
            &MemoryStore::failing(),
            created.config_id,
            ImagePhase::Experiment,
            Duration::from_secs(600),
        )
        .await;

        assert!(matches!(result, Err(AppError::ExternalService(_))));
    }

    #[tokio::test]
    async fn test_get_document() {
        let test_db = create_standard_test_db().await;

        let mut config = sample_configuration(&["a"], None);
        config.files.study_debrief = None;
        let created = test_db
            .create_study("researcher@example.com", config)
            .await
            .unwrap();

        let consent = get_document(&test_db.pool, created.config_id, DocumentKind::ConsentForm)
            .await
            .unwrap();
        assert_eq!(consent.filename, "consent.pdf");
        assert_eq!(consent.bytes, b"%PDF-1.4 consent".to_vec());

        let instructions =
            get_document(&test_db.pool, created.config_id, DocumentKind::Instructions)
                .await
                .unwrap();
        assert_eq!(instructions.filename, "instructions.txt");

        assert!(matches!(
            get_document(&test_db.pool, created.config_id, DocumentKind::Debrief).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            get_document(&test_db.pool, Uuid::new_v4(), DocumentKind::ConsentForm).await,
            Err(AppError::NotFound(_))
        ));
    }
}

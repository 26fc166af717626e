#[cfg(test)]
mod tests {
    use crate::db::{record_responses, start_result, submit_results};
    use crate::error::AppError;
    use crate::models::{ResponseSubmission, SubmissionPolicy};
    use crate::test::test_db::{
        TestDb, TestDbBuilder, create_standard_test_db, file_pool, sample_configuration,
    };
    use rocket::tokio;
    use tempfile::TempDir;
    use uuid::Uuid;

    const STRICT: SubmissionPolicy = SubmissionPolicy {
        allow_resubmission: false,
    };
    const LENIENT: SubmissionPolicy = SubmissionPolicy {
        allow_resubmission: true,
    };

    fn response(image_id: &str, answer: i64, response_time: f64) -> ResponseSubmission {
        ResponseSubmission {
            image_id: image_id.to_string(),
            answer,
            response_time,
        }
    }

    async fn study_db() -> (TestDb, Uuid) {
        let test_db = create_standard_test_db().await;
        let created = test_db
            .create_study(
                "researcher@example.com",
                sample_configuration(&["faces/a.jpg", "faces/b.jpg"], None),
            )
            .await
            .unwrap();
        (test_db, created.config_id)
    }

    #[tokio::test]
    async fn test_submit_results_stores_sequenced_responses() {
        let (test_db, config_id) = study_db().await;

        let submitted = submit_results(
            &test_db.pool,
            config_id,
            "subject-1",
            vec![response("faces/b.jpg", 1, 0.8), response("faces/a.jpg", 0, 1.25)],
            STRICT,
        )
        .await
        .expect("Failed to submit results");

        assert_eq!(submitted.response_count, 2);

        let rows: Vec<(i64, String, i64, f64)> = sqlx::query_as(
            "SELECT sequence, image_id, answer, response_time FROM study_responses
             WHERE result_id = ? ORDER BY sequence",
        )
        .bind(submitted.result_id)
        .fetch_all(&test_db.pool)
        .await
        .unwrap();

        assert_eq!(
            rows,
            vec![
                (1, "faces/b.jpg".to_string(), 1, 0.8),
                (2, "faces/a.jpg".to_string(), 0, 1.25)
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_results_validation() {
        let (test_db, config_id) = study_db().await;

        assert!(matches!(
            submit_results(&test_db.pool, config_id, "   ", vec![], STRICT).await,
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            submit_results(
                &test_db.pool,
                config_id,
                "subject-1",
                vec![response("faces/a.jpg", 1, -1.0)],
                STRICT
            )
            .await,
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            submit_results(
                &test_db.pool,
                config_id,
                "subject-1",
                vec![response("", 1, 1.0)],
                STRICT
            )
            .await,
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            submit_results(&test_db.pool, Uuid::new_v4(), "subject-1", vec![], STRICT).await,
            Err(AppError::NotFound(_))
        ));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM study_results")
            .fetch_one(&test_db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0, "Rejected submissions must not leave result sets");
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_a_conflict() {
        let (test_db, config_id) = study_db().await;
        let responses = vec![response("faces/a.jpg", 1, 0.5)];

        let (first, second) = tokio::join!(
            submit_results(&test_db.pool, config_id, "subject-1", responses.clone(), STRICT),
            submit_results(&test_db.pool, config_id, "subject-1", responses.clone(), STRICT),
        );

        let outcomes = [first, second];
        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(AppError::Conflict(_))))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_on_file_database() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir, 6).await.unwrap();
        let test_db = TestDbBuilder::new()
            .researcher("researcher@example.com")
            .build_on(pool)
            .await
            .unwrap();
        let config_id = test_db
            .create_study(
                "researcher@example.com",
                sample_configuration(&["faces/a.jpg", "faces/b.jpg"], None),
            )
            .await
            .unwrap()
            .config_id;

        for round in 0..10 {
            let subject_id = format!("subject-{}", round);
            let submitters: Vec<_> = (0..6)
                .map(|_| {
                    let pool = test_db.pool.clone();
                    let subject_id = subject_id.clone();
                    tokio::spawn(async move {
                        let responses = vec![
                            response("faces/a.jpg", 1, 0.5),
                            response("faces/b.jpg", 0, 0.7),
                        ];
                        submit_results(&pool, config_id, &subject_id, responses, STRICT).await
                    })
                })
                .collect();

            let mut successes = 0;
            for submitter in submitters {
                match submitter.await.unwrap() {
                    Ok(_) => successes += 1,
                    Err(AppError::Conflict(_)) => {}
                    Err(other) => panic!("round {}: expected a conflict, got {:?}", round, other),
                }
            }
            assert_eq!(successes, 1, "round {}", round);
        }

        let (results,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM study_results")
            .fetch_one(&test_db.pool)
            .await
            .unwrap();
        let (responses,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM study_responses")
            .fetch_one(&test_db.pool)
            .await
            .unwrap();
        assert_eq!(results, 10);
        assert_eq!(responses, 20);
    }

    #[tokio::test]
    async fn test_resubmission_allowed_by_policy() {
        let (test_db, config_id) = study_db().await;
        let responses = vec![response("faces/a.jpg", 1, 0.5)];

        let first = submit_results(&test_db.pool, config_id, "subject-1", responses.clone(), LENIENT)
            .await
            .unwrap();
        let second = submit_results(&test_db.pool, config_id, "subject-1", responses, LENIENT)
            .await
            .unwrap();

        assert_ne!(first.result_id, second.result_id);
    }

    #[tokio::test]
    async fn test_start_then_record_responses() {
        let (test_db, config_id) = study_db().await;

        let result_id = start_result(&test_db.pool, config_id, "subject-2", STRICT)
            .await
            .unwrap();

        assert!(matches!(
            start_result(&test_db.pool, config_id, "subject-2", STRICT).await,
            Err(AppError::Conflict(_))
        ));

        let count = record_responses(
            &test_db.pool,
            result_id,
            vec![response("faces/a.jpg", 1, 0.4), response("faces/b.jpg", 1, 0.6)],
        )
        .await
        .unwrap();
        assert_eq!(count, 2);

        assert!(matches!(
            record_responses(&test_db.pool, result_id, vec![response("faces/a.jpg", 0, 0.1)])
                .await,
            Err(AppError::Conflict(_))
        ));

        assert!(matches!(
            record_responses(&test_db.pool, Uuid::new_v4(), vec![]).await,
            Err(AppError::NotFound(_))
        ));
    }
}

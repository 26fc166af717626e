#[cfg(test)]
mod tests {
    use crate::db::{get_survey_answer, get_survey_questions, save_survey_answer};
    use crate::error::AppError;
    use crate::models::SurveyAnswer;
    use crate::test::test_db::{create_standard_test_db, sample_configuration};
    use rocket::tokio;
    use uuid::Uuid;

    fn answer(subject_id: &str, age: i64) -> SurveyAnswer {
        SurveyAnswer {
            subject_id: subject_id.to_string(),
            age,
            sex: " female ".to_string(),
            race: "Asian".to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_and_fetch_survey_answer() {
        let test_db = create_standard_test_db().await;

        let saved = save_survey_answer(&test_db.pool, answer(" subject-1 ", 34))
            .await
            .expect("Failed to save survey answer");

        assert_eq!(saved.subject_id, "subject-1");
        assert_eq!(saved.sex, "female");
        assert_eq!(saved.age, 34);

        let fetched = get_survey_answer(&test_db.pool, "subject-1").await.unwrap();
        assert_eq!(fetched, saved);
    }

    #[tokio::test]
    async fn test_survey_answer_validation_and_conflict() {
        let test_db = create_standard_test_db().await;

        assert!(matches!(
            save_survey_answer(&test_db.pool, answer("subject-1", 151)).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            save_survey_answer(&test_db.pool, answer("   ", 20)).await,
            Err(AppError::Validation(_))
        ));

        save_survey_answer(&test_db.pool, answer("subject-1", 20))
            .await
            .unwrap();
        assert!(matches!(
            save_survey_answer(&test_db.pool, answer("subject-1", 21)).await,
            Err(AppError::Conflict(_))
        ));

        assert!(matches!(
            get_survey_answer(&test_db.pool, "nobody").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_survey_questions_in_position_order() {
        let test_db = create_standard_test_db().await;

        let with_survey = test_db
            .create_study(
                "researcher@example.com",
                sample_configuration(&["a"], Some(&["First?", "Second?", "Third?"])),
            )
            .await
            .unwrap();
        let without_survey = test_db
            .create_study("researcher@example.com", sample_configuration(&["a"], None))
            .await
            .unwrap();

        assert_eq!(
            get_survey_questions(&test_db.pool, with_survey.config_id)
                .await
                .unwrap(),
            vec!["First?", "Second?", "Third?"]
        );
        assert!(
            get_survey_questions(&test_db.pool, without_survey.config_id)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            get_survey_questions(&test_db.pool, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}

#[cfg(test)]
mod tests {
    use crate::auth::{Permission, Role, User};
    use crate::db::{
        authenticate_user, create_user, ensure_bootstrap_admin, find_user_by_email, get_all_users,
        get_user, update_user_role,
    };
    use crate::env::BootstrapAdmin;
    use crate::error::AppError;
    use crate::test::test_db::{STANDARD_PASSWORD, TestDbBuilder, create_standard_test_db};
    use rocket::tokio;

    fn user_with_role(role: Role) -> User {
        User {
            id: 1,
            email: "someone@example.com".to_string(),
            role,
            display_name: None,
            is_active: true,
        }
    }

    #[test]
    fn test_role_permissions_are_cumulative() {
        let researcher = user_with_role(Role::Researcher);
        let staff = user_with_role(Role::Staff);
        let admin = user_with_role(Role::Admin);

        assert!(researcher.has_permission(Permission::CreateConfigurations));
        assert!(researcher.has_permission(Permission::ManageImages));
        assert!(!researcher.has_permission(Permission::SearchResearchers));
        assert!(!researcher.has_permission(Permission::ListUsers));
        assert!(!researcher.has_permission(Permission::DeleteSharedImages));

        assert!(staff.has_permission(Permission::ExportOwnResults));
        assert!(staff.has_permission(Permission::ViewResearcherResults));
        assert!(staff.has_permission(Permission::DeleteSharedImages));
        assert!(!staff.has_permission(Permission::EditUserRoles));

        for permission in Role::Staff.permissions() {
            assert!(admin.has_permission(*permission));
        }
        assert!(admin.has_permission(Permission::EditUserRoles));

        assert!(matches!(
            researcher.require_permission(Permission::ListUsers),
            Err(AppError::Authorization(_))
        ));
        assert!(admin.require_permission(Permission::ListUsers).is_ok());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("staff".parse::<Role>().unwrap(), Role::Staff);
        assert_eq!(Role::Admin.to_string(), "admin");
        assert!("coach".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn test_create_user_normalizes_email_and_rejects_duplicates() {
        let test_db = TestDbBuilder::new().build().await.unwrap();

        let id = create_user(
            &test_db.pool,
            "  New.Person@Example.com ",
            "secret-password",
            Role::Researcher,
            Some("New Person"),
        )
        .await
        .unwrap();

        let user = get_user(&test_db.pool, id).await.unwrap();
        assert_eq!(user.email, "new.person@example.com");
        assert_eq!(user.display_name.as_deref(), Some("New Person"));
        assert_eq!(user.role, Role::Researcher);
        assert!(user.is_active);

        let duplicate = create_user(
            &test_db.pool,
            "new.person@example.com",
            "another-password",
            Role::Researcher,
            None,
        )
        .await;
        assert!(matches!(duplicate, Err(AppError::Conflict(_))));

        let found = find_user_by_email(&test_db.pool, "NEW.PERSON@example.com")
            .await
            .unwrap();
        assert_eq!(found.map(|u| u.id), Some(id));
    }

    #[tokio::test]
    async fn test_authenticate_user() {
        let test_db = create_standard_test_db().await;

        let user = authenticate_user(&test_db.pool, "researcher@example.com", STANDARD_PASSWORD)
            .await
            .unwrap()
            .expect("Valid credentials should authenticate");
        assert_eq!(user.email, "researcher@example.com");

        assert!(
            authenticate_user(&test_db.pool, "researcher@example.com", "wrong")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            authenticate_user(&test_db.pool, "nobody@example.com", STANDARD_PASSWORD)
                .await
                .unwrap()
                .is_none()
        );

        sqlx::query("UPDATE users SET is_active = FALSE WHERE email = ?")
            .bind("researcher@example.com")
            .execute(&test_db.pool)
            .await
            .unwrap();
        assert!(
            authenticate_user(&test_db.pool, "researcher@example.com", STANDARD_PASSWORD)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_user_role() {
        let test_db = create_standard_test_db().await;
        let id = test_db.user_id("researcher@example.com").unwrap();

        let updated = update_user_role(&test_db.pool, id, Role::Staff).await.unwrap();
        assert_eq!(updated.role, Role::Staff);

        assert!(matches!(
            update_user_role(&test_db.pool, 9999, Role::Admin).await,
            Err(AppError::NotFound(_))
        ));

        let users = get_all_users(&test_db.pool).await.unwrap();
        assert_eq!(users.len(), 4);
    }

    #[tokio::test]
    async fn test_bootstrap_admin_is_created_once() {
        let test_db = TestDbBuilder::new().build().await.unwrap();
        let admin = BootstrapAdmin {
            email: "root@example.com".to_string(),
            password: "bootstrap-password".to_string(),
        };

        assert!(ensure_bootstrap_admin(&test_db.pool, &admin).await.unwrap());
        assert!(!ensure_bootstrap_admin(&test_db.pool, &admin).await.unwrap());

        let user = authenticate_user(&test_db.pool, "root@example.com", "bootstrap-password")
            .await
            .unwrap()
            .expect("Bootstrap admin should be able to log in");
        assert_eq!(user.role, Role::Admin);
    }
}

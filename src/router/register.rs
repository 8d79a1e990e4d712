use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::account::{Registered, RegistrationRequest};
use crate::error::Result;
use crate::router::ValidWithState;

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(context = AppState)]
pub struct Body {
    #[validate(
        length(min = 3, max = 32),
        custom(
            function = "crate::router::validate_identifier",
            message = "Registration number must be alphanumeric."
        )
    )]
    pub registration_number: String,
    #[validate(custom(
        function = "crate::router::validate_identifier",
        message = "Application number must be alphanumeric."
    ))]
    pub application_number: Option<String>,
    #[validate(length(min = 1, max = 255, message = "Name is required."))]
    pub name: String,
    pub gender: Option<String>,
    pub marital_status: Option<String>,
    #[validate(length(min = 1, max = 128, message = "Department is required."))]
    pub department: String,
    #[validate(length(min = 1, max = 128, message = "Program is required."))]
    pub program: String,
    #[validate(length(
        min = 4,
        max = 64,
        message = "Government identifier is required."
    ))]
    pub national_id: String,
    #[validate(length(min = 1, max = 512, message = "Address is required."))]
    pub address: String,
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(min = 7, max = 20, message = "Phone must be formatted."))]
    pub phone: String,
    #[validate(
        length(
            min = 8,
            max = 255,
            message = "Password must contain at least 8 characters."
        ),
        custom(
            function = "crate::router::validate_password",
            message = "Password is too weak.",
            use_context
        )
    )]
    pub password: String,
}

impl From<Body> for RegistrationRequest {
    fn from(body: Body) -> Self {
        RegistrationRequest {
            registration_number: body.registration_number,
            application_number: body.application_number,
            name: body.name,
            gender: body.gender,
            marital_status: body.marital_status,
            department: body.department,
            program: body.program,
            national_id: body.national_id,
            address: body.address,
            email: body.email,
            phone: body.phone,
            password: body.password,
        }
    }
}

/// Handler to register an applicant.
pub async fn handler(
    State(state): State<AppState>,
    ValidWithState(body): ValidWithState<Body>,
) -> Result<(StatusCode, Json<Registered>)> {
    let registered = state.registration.register(body.into()).await?;

    Ok((StatusCode::CREATED, Json(registered)))
}

#[cfg(test)]
pub(super) mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::json;
    use sqlx::{Pool, Postgres, Row};

    use super::*;
    use crate::*;

    pub(crate) fn req_body() -> serde_json::Value {
        json!({
            "registration_number": "REG-2024-001",
            "application_number": "APP-2024-001",
            "name": "Ada Lovelace",
            "gender": "F",
            "department": "Mathematics",
            "program": "BSc",
            "national_id": "NG-12345678",
            "address": "12 Analytical Row",
            "email": "a@example.com",
            "phone": "+2348012345678",
            "password": "Abcd1234",
        })
    }

    #[sqlx::test]
    async fn test_register_handler(pool: Pool<Postgres>) {
        let state = router::tests::state(pool.clone());
        let app = app(state);

        let response = make_request(
            app,
            Method::POST,
            "/register",
            req_body().to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: account::Registered =
            serde_json::from_slice(&body).unwrap();
        assert!(body.requires_verification);

        let active: bool =
            sqlx::query(r#"SELECT active FROM accounts WHERE id = $1"#)
                .bind(body.account_id)
                .fetch_one(&pool)
                .await
                .unwrap()
                .try_get("active")
                .unwrap();
        assert!(!active);
    }

    #[sqlx::test]
    async fn test_register_duplicate_conflicts(pool: Pool<Postgres>) {
        let state = router::tests::state(pool);
        let app = app(state);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/register",
            req_body().to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = make_request(
            app,
            Method::POST,
            "/register",
            req_body().to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[sqlx::test]
    async fn test_register_weak_password(pool: Pool<Postgres>) {
        let state = router::tests::state(pool.clone());
        let app = app(state);

        let mut body = req_body();
        body["password"] = json!("short");
        let response =
            make_request(app, Method::POST, "/register", body.to_string())
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // No account was created.
        let total: i64 =
            sqlx::query(r#"SELECT COUNT(*) AS total FROM accounts"#)
                .fetch_one(&pool)
                .await
                .unwrap()
                .try_get("total")
                .unwrap();
        assert_eq!(total, 0);
    }
}

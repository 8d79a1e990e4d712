use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::router::ValidWithState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(context = AppState)]
pub struct ForgotBody {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
}

/// Handler to request a password-reset link.
///
/// Uniform response whether or not the address is registered.
pub async fn forgot(
    State(state): State<AppState>,
    ValidWithState(body): ValidWithState<ForgotBody>,
) -> Result<Json<Response>> {
    state.registration.request_password_reset(&body.email).await?;

    Ok(Json(Response {
        message: "If this address is registered, a reset link has been sent."
            .to_owned(),
    }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(context = AppState)]
pub struct ResetBody {
    #[validate(length(min = 1, message = "Token is required."))]
    pub token: String,
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

/// Handler to redeem a reset token and rotate the credential.
pub async fn reset(
    State(state): State<AppState>,
    ValidWithState(body): ValidWithState<ResetBody>,
) -> Result<Json<Response>> {
    state
        .registration
        .reset_password(&body.token, &body.password)
        .await?;

    Ok(Json(Response {
        message: "Password updated. You can now sign in.".to_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;
    use sqlx::{Pool, Postgres, Row};

    use crate::router::register::tests::req_body;
    use crate::*;

    #[sqlx::test]
    async fn test_forgot_is_uniform(pool: Pool<Postgres>) {
        let state = router::tests::state(pool);
        let app = app(state);

        // Unknown address gets the same 200 as a known one.
        let response = make_request(
            app.clone(),
            Method::POST,
            "/password/forgot",
            json!({ "email": "ghost@example.com" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

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
            "/password/forgot",
            json!({ "email": "a@example.com" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[sqlx::test]
    async fn test_reset_flow(pool: Pool<Postgres>) {
        let state = router::tests::state(pool.clone());
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
            app.clone(),
            Method::POST,
            "/password/forgot",
            json!({ "email": "a@example.com" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let token: String = sqlx::query(
            r#"SELECT token FROM password_reset_tokens LIMIT 1"#,
        )
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("token")
        .unwrap();

        let response = make_request(
            app.clone(),
            Method::POST,
            "/password/reset",
            json!({ "token": token, "password": "Efgh5678" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        // Single use.
        let response = make_request(
            app,
            Method::POST,
            "/password/reset",
            json!({ "token": token, "password": "Ijkl9012" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[sqlx::test]
    async fn test_reset_weak_password(pool: Pool<Postgres>) {
        let state = router::tests::state(pool);
        let app = app(state);

        let response = make_request(
            app,
            Method::POST,
            "/password/reset",
            json!({ "token": "whatever", "password": "short" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

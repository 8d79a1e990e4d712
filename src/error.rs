//! Error handler for matricula.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// User-facing text shared by every token failure, so callers cannot tell a
/// missing token from an expired or substituted one.
const TOKEN_FAILURE_DETAIL: &str =
    "This link is invalid or has expired. Request a new one.";

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    /// Another account or profile already claims one of the identifying
    /// attributes. Terminal for this attempt.
    #[error("identity already registered")]
    AlreadyExists,

    /// Resend requested for an account that is already active.
    #[error("account is already verified")]
    AlreadyVerified,

    /// Token absent, expired or already redeemed.
    #[error("token is expired or invalid")]
    ExpiredOrInvalid,

    /// Link identifier disagrees with the token's owning identifier.
    #[error("link does not match token")]
    LinkMismatch,

    /// Resend cap reached inside the trailing window.
    #[error("rate limited, retry in {retry_after} seconds")]
    RateLimited { retry_after: i64 },

    /// Encryption or decryption failure. Never detailed to the caller.
    #[error("data protection failure")]
    Protection(#[from] crate::crypto::CryptoError),

    /// Unclassified persistence failure. The catch-all opaque 500.
    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),
}

impl ServerError {
    /// Translate a constraint race on insert into [`ServerError::AlreadyExists`].
    pub fn from_insert(err: SQLxError) -> Self {
        if err
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation())
        {
            ServerError::AlreadyExists
        } else {
            ServerError::Sql(err)
        }
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::AlreadyExists => response
                .title("This identity is already registered.")
                .details("An account with these details already exists. Sign in instead.")
                .status(StatusCode::CONFLICT),

            ServerError::AlreadyVerified => response
                .title("Account already verified.")
                .details("This account is already active. Sign in instead.")
                .status(StatusCode::CONFLICT),

            // One generic body for every token problem.
            ServerError::ExpiredOrInvalid | ServerError::LinkMismatch => {
                tracing::debug!(err = %self, "token redemption refused");

                response
                    .title("Verification link refused.")
                    .details(TOKEN_FAILURE_DETAIL)
                    .status(StatusCode::GONE)
            },

            ServerError::RateLimited { retry_after } => {
                let response = response
                    .title("Too many requests.")
                    .details("Resend limit reached. Try again later.")
                    .status(StatusCode::TOO_MANY_REQUESTS);

                let mut response = response
                    .into_response()
                    .unwrap_or_else(|_| internal_server_error());
                if let Ok(value) = retry_after.to_string().parse() {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            },

            // Internal failures: full detail in the server log, opaque body.
            ServerError::Protection(err) => {
                tracing::error!(err = %err, "data protection failure");

                ResponseError::default()
            },
            ServerError::Sql(err) => {
                tracing::error!(err = %err, "registration persistence failure");

                ResponseError::default()
            },

            _ => response,
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

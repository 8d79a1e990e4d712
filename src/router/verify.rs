use axum::{Json, extract::Query, extract::State};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::link;
use crate::router::ValidWithState;

/// Raw link parameters. Everything optional: absence is a malformed link,
/// not a deserialization crash.
#[derive(Debug, Deserialize)]
pub struct Params {
    e: Option<String>,
    t: Option<String>,
    h: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub message: String,
}

/// Handler to redeem a verification link.
pub async fn handler(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Json<Response>> {
    let parsed = link::parse_link_params(
        params.e.as_deref(),
        params.t.as_deref(),
        params.h.as_deref(),
    )
    .ok_or(ServerError::ExpiredOrInvalid)?;

    state
        .registration
        .verify_email(&parsed.token, params.e.as_deref())
        .await?;

    Ok(Json(Response {
        message: "Email verified. You can now sign in.".to_owned(),
    }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(context = AppState)]
pub struct ResendBody {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
}

/// Handler to resend the verification mail.
pub async fn resend(
    State(state): State<AppState>,
    ValidWithState(body): ValidWithState<ResendBody>,
) -> Result<Json<Response>> {
    state.registration.resend_verification(&body.email).await?;

    Ok(Json(Response {
        message: "Verification email sent.".to_owned(),
    }))
}

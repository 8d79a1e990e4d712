use axum::{Json, extract::Path, extract::State};

use crate::AppState;
use crate::account::VerificationResult;
use crate::error::Result;

/// Handler for identifier lookup, used by the UI to pre-fill forms.
pub async fn handler(
    State(state): State<AppState>,
    Path(registration_number): Path<String>,
) -> Result<Json<VerificationResult>> {
    let result =
        state.registration.lookup_profile(&registration_number).await?;

    Ok(Json(result))
}

//! Registration and verification HTTP API.

pub mod lookup;
pub mod password;
pub mod register;
pub mod status;
pub mod verify;

use std::sync::OnceLock;

use axum::Json;
use axum::extract::{FromRequest, Request};
use regex_lite::Regex;
use validator::{ValidateArgs, ValidationError};

use crate::AppState;
use crate::error::ServerError;

/// Registration numbers: alphanumeric with `-` or `/` separators.
fn registration_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9/-]{2,31}$")
            .expect("invalid registration number pattern")
    })
}

/// Custom validator for identifier fields.
pub fn validate_identifier(value: &str) -> Result<(), ValidationError> {
    if registration_number_pattern().is_match(value.trim()) {
        Ok(())
    } else {
        Err(ValidationError::new("identifier_format"))
    }
}

/// Custom validator running the configured password policy.
pub fn validate_password(
    value: &str,
    state: &AppState,
) -> Result<(), ValidationError> {
    state.policy.validate(value).map_err(|errors| {
        let messages: Vec<String> = errors
            .field_errors()
            .values()
            .flat_map(|issues| {
                issues.iter().filter_map(|i| {
                    i.message.as_ref().map(|m| m.to_string())
                })
            })
            .collect();

        ValidationError::new("password_policy")
            .with_message(messages.join(" ").into())
    })
}

/// JSON extractor that validates the body against the shared state.
///
/// All field violations are accumulated and rendered together.
pub struct ValidWithState<T>(pub T);

impl<T> FromRequest<AppState> for ValidWithState<T>
where
    T: serde::de::DeserializeOwned
        + for<'a> ValidateArgs<'a, Args = &'a AppState>,
{
    type Rejection = ServerError;

    async fn from_request(
        req: Request,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Json(body) = Json::<T>::from_request(req, state).await?;
        body.validate_with_args(state)?;
        Ok(ValidWithState(body))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use sqlx::{Pool, Postgres};

    use crate::account::RegistrationService;
    use crate::audit::AuditSink;
    use crate::config::{Configuration, ReissuePolicy, TokenPolicy};
    use crate::crypto::{Crypto, PasswordPolicy};
    use crate::mail::StubNotifier;
    use crate::AppState;
    use crate::token::TokenManager;

    /// Test state over a stubbed mail gateway.
    pub(crate) fn state(pool: Pool<Postgres>) -> AppState {
        state_with_notifier(pool, Arc::new(StubNotifier::default()))
    }

    pub(crate) fn state_with_notifier(
        pool: Pool<Postgres>,
        mail: Arc<StubNotifier>,
    ) -> AppState {
        let config = Arc::new(Configuration {
            url: "https://portal.example.edu".into(),
            tokens: TokenPolicy {
                reissue: ReissuePolicy::Always,
                ..Default::default()
            },
            ..Default::default()
        });
        let crypto =
            Arc::new(Crypto::new(None, "test_master_key", [0x42; 16]).unwrap());
        let tokens = TokenManager::new(
            pool.clone(),
            config.tokens.clone(),
            crypto.pepper(),
        );
        let audit = AuditSink::new(pool.clone());
        let registration = RegistrationService::new(
            pool,
            crypto,
            tokens,
            mail,
            audit,
            Arc::clone(&config),
        );

        AppState {
            policy: PasswordPolicy::new(config.password.clone()),
            config,
            registration,
        }
    }
}

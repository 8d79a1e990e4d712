//! Append-only audit trail of registration and verification actions.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::Result;

/// Audited actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    AccountRegistered,
    EmailVerified,
    VerificationResent,
    PasswordResetRequested,
    PasswordReset,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::AccountRegistered => "ACCOUNT_REGISTERED",
            Action::EmailVerified => "EMAIL_VERIFIED",
            Action::VerificationResent => "VERIFICATION_RESENT",
            Action::PasswordResetRequested => "PASSWORD_RESET_REQUESTED",
            Action::PasswordReset => "PASSWORD_RESET",
        }
    }
}

/// Best-effort sink over the `audit_events` table.
///
/// Events are never mutated or deleted here; write failures are logged and
/// swallowed so a completed registration is never reported as failed because
/// its audit record could not be stored.
#[derive(Clone)]
pub struct AuditSink {
    pool: PgPool,
}

impl AuditSink {
    /// Create a new [`AuditSink`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event. Failures are logged, never propagated.
    pub async fn record(
        &self,
        action: Action,
        account_id: Option<Uuid>,
        identifier: Option<&str>,
        detail: serde_json::Value,
    ) {
        let result = sqlx::query(
            r#"INSERT INTO audit_events (account_id, identifier, action, detail)
                VALUES ($1, $2, $3, $4)"#,
        )
        .bind(account_id)
        .bind(identifier)
        .bind(action.as_str())
        .bind(detail)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(
                action = action.as_str(),
                err = %err,
                "audit event dropped"
            );
        }
    }

    /// Count events for an identifier since a point in time.
    ///
    /// Feeds the resend rate limiter; unlike [`AuditSink::record`] a failure
    /// here must propagate, an unreadable ledger cannot admit more sends.
    pub async fn count_since(
        &self,
        identifier: &str,
        action: Action,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS total FROM audit_events
                WHERE identifier = $1 AND action = $2 AND created_at >= $3"#,
        )
        .bind(identifier)
        .bind(action.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("total")?)
    }
}

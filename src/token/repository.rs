//! Durable storage for verification and password-reset tokens.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;

/// Verification token row, keyed by contact identifier.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct TokenRow {
    pub identifier: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Password-reset token row, keyed by account id.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ResetTokenRow {
    pub account_id: Uuid,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Token store.
///
/// `replace` deletes and inserts inside one transaction: the single-live-token
/// invariant holds even under concurrent issuers, the last commit wins.
#[derive(Clone)]
pub struct TokenRepository {
    pool: PgPool,
}

impl TokenRepository {
    /// Create a new [`TokenRepository`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Invalidate every token owned by `identifier`, then insert the new one.
    pub async fn replace(
        &self,
        identifier: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        sqlx::query(r#"DELETE FROM verification_tokens WHERE identifier = $1"#)
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"INSERT INTO verification_tokens (identifier, token, expires_at)
                VALUES ($1, $2, $3)"#,
        )
        .bind(identifier)
        .bind(token)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Look a token up by its secret.
    pub async fn find(&self, token: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"SELECT identifier, token, created_at, expires_at
                FROM verification_tokens WHERE token = $1"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Most recent token owned by `identifier`, live or not.
    pub async fn latest_for_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"SELECT identifier, token, created_at, expires_at
                FROM verification_tokens WHERE identifier = $1
                ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Atomically claim one token: destroy it and return its row.
    ///
    /// Of N concurrent claimants exactly one gets the row; the rest get
    /// `None`. This is what makes redemption single-use under duplicate
    /// submissions.
    pub async fn take(&self, token: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"DELETE FROM verification_tokens WHERE token = $1
                RETURNING identifier, token, created_at, expires_at"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Destroy one token (expiry sweep).
    pub async fn delete(&self, token: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM verification_tokens WHERE token = $1"#)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Destroy every token owned by `identifier`.
    pub async fn delete_for_identifier(&self, identifier: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM verification_tokens WHERE identifier = $1"#)
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reset-token variant of [`TokenRepository::replace`].
    pub async fn replace_reset(
        &self,
        account_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        sqlx::query(
            r#"DELETE FROM password_reset_tokens WHERE account_id = $1"#,
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"INSERT INTO password_reset_tokens (account_id, token, expires_at)
                VALUES ($1, $2, $3)"#,
        )
        .bind(account_id)
        .bind(token)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Reset-token variant of [`TokenRepository::take`].
    pub async fn take_reset(
        &self,
        token: &str,
    ) -> Result<Option<ResetTokenRow>> {
        let row = sqlx::query_as::<_, ResetTokenRow>(
            r#"DELETE FROM password_reset_tokens WHERE token = $1
                RETURNING account_id, token, created_at, expires_at"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

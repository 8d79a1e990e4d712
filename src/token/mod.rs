//! Verification token lifecycle.
//!
//! Per identifier the state machine is
//! `NoToken -> Issued -> {Redeemed | Expired | Superseded}`; at most one
//! live token exists per identifier at any instant.

mod repository;

pub use repository::*;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sqlx::PgPool;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{Action, AuditSink};
use crate::config::{ReissuePolicy, TokenPolicy};
use crate::error::{Result, ServerError};
use crate::link;

/// Raw entropy per secret; 32 bytes, URL-safe encoded to 43 characters.
const SECRET_LENGTH: usize = 32;

const VERIFY_PATH: &str = "/verify";
const RESET_PATH: &str = "/password/reset";

/// Orchestrates token issuance, supersession and redemption.
#[derive(Clone)]
pub struct TokenManager {
    repo: TokenRepository,
    policy: TokenPolicy,
    pepper: Zeroizing<Vec<u8>>,
}

impl TokenManager {
    /// Create a new [`TokenManager`].
    ///
    /// `pepper` is the shared secret also used by the link integrity stamp.
    pub fn new(pool: PgPool, policy: TokenPolicy, pepper: &[u8]) -> Self {
        Self {
            repo: TokenRepository::new(pool),
            policy,
            pepper: Zeroizing::new(pepper.to_vec()),
        }
    }

    fn generate_secret() -> String {
        let mut bytes = [0u8; SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Issue a verification token for `identifier`.
    ///
    /// Under [`ReissuePolicy::Cooldown`] a live token younger than the
    /// cool-down window is returned unchanged, absorbing duplicate UI
    /// submissions. Otherwise every prior token is invalidated before the
    /// new one is inserted.
    pub async fn issue(&self, identifier: &str) -> Result<String> {
        if self.policy.reissue == ReissuePolicy::Cooldown
            && let Some(row) =
                self.repo.latest_for_identifier(identifier).await?
        {
            let now = Utc::now();
            let age = now - row.created_at;
            if row.expires_at > now
                && age < Duration::minutes(self.policy.cooldown_minutes)
            {
                tracing::debug!(identifier, "returning token inside cool-down");
                return Ok(row.token);
            }
        }

        let token = Self::generate_secret();
        let expires_at =
            Utc::now() + Duration::hours(self.policy.verification_ttl_hours);
        self.repo.replace(identifier, &token, expires_at).await?;

        Ok(token)
    }

    /// Compose the verification link for a freshly issued token.
    pub fn build_link(
        &self,
        base_url: &str,
        identifier: &str,
        token: &str,
    ) -> String {
        link::compose(base_url, VERIFY_PATH, identifier, token, &self.pepper)
    }

    /// Redeem a verification token.
    ///
    /// Single-use: success destroys the row and returns the owning
    /// identifier. Expired rows encountered here are swept on sight.
    pub async fn redeem(
        &self,
        token: &str,
        encoded_identifier: Option<&str>,
    ) -> Result<String> {
        let Some(row) = self.repo.find(token).await? else {
            return Err(ServerError::ExpiredOrInvalid);
        };

        if row.expires_at <= Utc::now() {
            self.repo.delete(token).await?;
            return Err(ServerError::ExpiredOrInvalid);
        }

        if self.policy.bind_identifier {
            let Some(encoded) = encoded_identifier else {
                return Err(ServerError::ExpiredOrInvalid);
            };
            // Token/link substitution defense. A mismatch leaves the token
            // intact, so probing cannot burn it.
            match link::decode_identifier(encoded) {
                Some(id) if id == row.identifier => {},
                _ => return Err(ServerError::LinkMismatch),
            }
        }

        // Atomic claim: of concurrent redeemers exactly one gets the row,
        // the rest see an already-redeemed token.
        let Some(row) = self.repo.take(token).await? else {
            return Err(ServerError::ExpiredOrInvalid);
        };
        Ok(row.identifier)
    }

    /// Invalidate every token owned by `identifier`.
    ///
    /// Compensation path when the verification mail cannot be dispatched.
    pub async fn invalidate(&self, identifier: &str) -> Result<()> {
        self.repo.delete_for_identifier(identifier).await
    }

    /// Reissue for a resend request, capped over a trailing window.
    ///
    /// Prior resends are counted from the audit trail; at or above the cap
    /// the call fails with a retry-after hint.
    pub async fn resend_with_rate_limit(
        &self,
        identifier: &str,
        audit: &AuditSink,
        window_minutes: i64,
        max_attempts: i64,
    ) -> Result<String> {
        let since = Utc::now() - Duration::minutes(window_minutes);
        let attempts = audit
            .count_since(identifier, Action::VerificationResent, since)
            .await?;

        if attempts >= max_attempts {
            return Err(ServerError::RateLimited {
                retry_after: window_minutes * 60,
            });
        }

        self.issue(identifier).await
    }

    /// Issue a password-reset token for an account. Always supersedes.
    pub async fn issue_reset(&self, account_id: Uuid) -> Result<String> {
        let token = Self::generate_secret();
        let expires_at =
            Utc::now() + Duration::minutes(self.policy.reset_ttl_minutes);
        self.repo.replace_reset(account_id, &token, expires_at).await?;

        Ok(token)
    }

    /// Compose the reset link for a freshly issued reset token.
    pub fn build_reset_link(
        &self,
        base_url: &str,
        account_id: Uuid,
        token: &str,
    ) -> String {
        link::compose(
            base_url,
            RESET_PATH,
            &account_id.to_string(),
            token,
            &self.pepper,
        )
    }

    /// Redeem a password-reset token. Single-use, same invariants as
    /// [`TokenManager::redeem`] without identifier binding.
    pub async fn redeem_reset(&self, token: &str) -> Result<Uuid> {
        // Claim first; there is no identifier binding to check, so the
        // single atomic delete settles any race.
        let Some(row) = self.repo.take_reset(token).await? else {
            return Err(ServerError::ExpiredOrInvalid);
        };

        if row.expires_at <= Utc::now() {
            // The claim already destroyed the row; nothing left to sweep.
            return Err(ServerError::ExpiredOrInvalid);
        }

        Ok(row.account_id)
    }
}

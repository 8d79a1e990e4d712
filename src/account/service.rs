//! Registration orchestration.
//!
//! Per account the state machine is
//! `Unregistered -> PendingVerification (active = false) -> Active`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::account::{
    AccountRepository, Gender, MaritalStatus, NewAccount, NewProfile,
    PrefillData, VerificationResult,
};
use crate::audit::{Action, AuditSink};
use crate::config::Configuration;
use crate::crypto::{Classification, Crypto};
use crate::error::{Result, ServerError};
use crate::mail::{Notify, Template};
use crate::token::TokenManager;

const STUDENT_ROLE: &str = "student";

/// Validated registration input, already shaped by the HTTP layer.
#[derive(Clone, Debug)]
pub struct RegistrationRequest {
    pub registration_number: String,
    pub application_number: Option<String>,
    pub name: String,
    pub gender: Option<String>,
    pub marital_status: Option<String>,
    pub department: String,
    pub program: String,
    pub national_id: String,
    pub address: String,
    pub email: String,
    pub phone: String,
    pub password: String,
}

/// Outcome of a successful registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub account_id: Uuid,
    pub profile_id: Uuid,
    pub requires_verification: bool,
}

/// Service holding the injected collaborators of the pipeline.
#[derive(Clone)]
pub struct RegistrationService {
    repo: AccountRepository,
    crypto: Arc<Crypto>,
    tokens: TokenManager,
    mail: Arc<dyn Notify>,
    audit: AuditSink,
    config: Arc<Configuration>,
}

impl RegistrationService {
    /// Create a new [`RegistrationService`].
    pub fn new(
        pool: PgPool,
        crypto: Arc<Crypto>,
        tokens: TokenManager,
        mail: Arc<dyn Notify>,
        audit: AuditSink,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            repo: AccountRepository::new(pool),
            crypto,
            tokens,
            mail,
            audit,
            config,
        }
    }

    /// Register an applicant: protect, dedupe, create, then dispatch the
    /// verification mail outside the transaction.
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<Registered> {
        // Normalize. Case-sensitive identifiers are canonicalized upper,
        // enumerated fields fall back to a safe vocabulary value.
        let registration_number =
            request.registration_number.trim().to_uppercase();
        let application_number = request
            .application_number
            .as_deref()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty());
        let email = request.email.trim().to_lowercase();
        let gender = Gender::normalize(request.gender.as_deref());
        let marital_status =
            MaritalStatus::normalize(request.marital_status.as_deref());

        // Protect every classified field; hash the credential.
        let account = NewAccount {
            email: self.crypto.protect(&email, Classification::Email)?,
            role: STUDENT_ROLE.to_owned(),
            password: self.crypto.pwd.hash_password(&request.password)?,
        };
        let profile = NewProfile {
            registration_number,
            application_number,
            department: request.department,
            program: request.program,
            gender: gender.as_str().to_owned(),
            marital_status: marital_status.as_str().to_owned(),
            name: self.crypto.protect(&request.name, Classification::Name)?,
            phone: self.crypto.protect(&request.phone, Classification::Phone)?,
            national_id: self
                .crypto
                .protect(&request.national_id, Classification::GovernmentId)?,
            address: self
                .crypto
                .protect(&request.address, Classification::Location)?,
        };

        // Uniqueness pre-check. The insert constraints remain authoritative
        // for concurrent duplicates.
        if self
            .repo
            .any_conflict(
                &profile.registration_number,
                profile.application_number.as_deref(),
                &account.email.hash,
                &profile.phone.hash,
            )
            .await?
        {
            return Err(ServerError::AlreadyExists);
        }

        // The only atomic boundary.
        let (account_id, profile_id) =
            self.repo.create(&account, &profile).await?;

        tracing::info!(%account_id, "account created, pending verification");

        // Post-commit, best-effort. Never rolls the account back.
        let dispatched = self.dispatch_verification(&email).await;
        self.audit
            .record(
                Action::AccountRegistered,
                Some(account_id),
                Some(&email),
                serde_json::json!({ "dispatched": dispatched }),
            )
            .await;

        Ok(Registered {
            account_id,
            profile_id,
            requires_verification: true,
        })
    }

    /// Issue a token and send the verification mail.
    ///
    /// On dispatch failure the just-issued token is invalidated so no
    /// unusable token lingers; the applicant can request a resend later.
    async fn dispatch_verification(&self, email: &str) -> bool {
        let token = match self.tokens.issue(email).await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(err = %err, "verification token not issued");
                return false;
            },
        };

        let link = self.tokens.build_link(&self.config.url, email, &token);
        let sent = self
            .mail
            .send(
                Template::VerifyEmail,
                email,
                serde_json::json!({ "link": link }),
            )
            .await;

        if let Err(err) = sent {
            tracing::warn!(err = %err, "verification mail not dispatched");
            if let Err(err) = self.tokens.invalidate(email).await {
                tracing::warn!(err = %err, "orphan verification token kept");
            }
            return false;
        }

        true
    }

    /// Redeem a verification token and activate the account.
    pub async fn verify_email(
        &self,
        token: &str,
        encoded_identifier: Option<&str>,
    ) -> Result<()> {
        let email = self.tokens.redeem(token, encoded_identifier).await?;

        let email_hash = self.crypto.search_hash(&email, Classification::Email);
        let Some(account) = self.repo.find_by_email_hash(&email_hash).await?
        else {
            // Token outlived its account; treat as any other dead token.
            return Err(ServerError::ExpiredOrInvalid);
        };

        self.repo.activate(account.id).await?;
        self.audit
            .record(
                Action::EmailVerified,
                Some(account.id),
                Some(&email),
                serde_json::json!({}),
            )
            .await;

        tracing::info!(account_id = %account.id, "account verified");

        // Verification already succeeded; a welcome failure is log-only.
        if let Err(err) = self
            .mail
            .send(Template::Welcome, &email, serde_json::json!({}))
            .await
        {
            tracing::warn!(err = %err, "welcome mail not dispatched");
        }

        Ok(())
    }

    /// Reissue and redispatch the verification mail, rate limited.
    pub async fn resend_verification(&self, email: &str) -> Result<()> {
        let email = email.trim().to_lowercase();
        let email_hash = self.crypto.search_hash(&email, Classification::Email);

        let Some(account) = self.repo.find_by_email_hash(&email_hash).await?
        else {
            // Same generic failure as a dead token, no enumeration.
            return Err(ServerError::ExpiredOrInvalid);
        };
        if account.active {
            return Err(ServerError::AlreadyVerified);
        }

        let token = self
            .tokens
            .resend_with_rate_limit(
                &email,
                &self.audit,
                self.config.tokens.resend_window_minutes,
                self.config.tokens.resend_max_attempts,
            )
            .await?;

        // The attempt counts toward the limit whether or not the mail
        // reaches the broker.
        self.audit
            .record(
                Action::VerificationResent,
                Some(account.id),
                Some(&email),
                serde_json::json!({}),
            )
            .await;

        let link = self.tokens.build_link(&self.config.url, &email, &token);
        if let Err(err) = self
            .mail
            .send(
                Template::VerifyEmail,
                &email,
                serde_json::json!({ "link": link }),
            )
            .await
        {
            tracing::warn!(err = %err, "resend mail not dispatched");
            if let Err(err) = self.tokens.invalidate(&email).await {
                tracing::warn!(err = %err, "orphan verification token kept");
            }
        }

        Ok(())
    }

    /// Issue a password-reset token when the account exists.
    ///
    /// Always succeeds from the caller's viewpoint so the endpoint cannot be
    /// used to enumerate registered addresses.
    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        let email = email.trim().to_lowercase();
        let email_hash = self.crypto.search_hash(&email, Classification::Email);

        let Some(account) = self.repo.find_by_email_hash(&email_hash).await?
        else {
            tracing::debug!("reset requested for unknown address");
            return Ok(());
        };

        let token = self.tokens.issue_reset(account.id).await?;
        let link =
            self.tokens.build_reset_link(&self.config.url, account.id, &token);

        self.audit
            .record(
                Action::PasswordResetRequested,
                Some(account.id),
                Some(&email),
                serde_json::json!({}),
            )
            .await;

        if let Err(err) = self
            .mail
            .send(
                Template::PasswordReset,
                &email,
                serde_json::json!({ "link": link }),
            )
            .await
        {
            tracing::warn!(err = %err, "reset mail not dispatched");
        }

        Ok(())
    }

    /// Redeem a reset token and rotate the credential.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<()> {
        let account_id = self.tokens.redeem_reset(token).await?;
        let password = self.crypto.pwd.hash_password(new_password)?;
        self.repo.update_password(account_id, &password).await?;

        self.audit
            .record(
                Action::PasswordReset,
                Some(account_id),
                None,
                serde_json::json!({}),
            )
            .await;

        Ok(())
    }

    /// Equality lookup by registration number for UI pre-fill.
    pub async fn lookup_profile(
        &self,
        registration_number: &str,
    ) -> Result<VerificationResult> {
        let registration_number =
            registration_number.trim().to_uppercase();

        let Some(profile) =
            self.repo.find_profile(&registration_number).await?
        else {
            return Ok(VerificationResult {
                exists: false,
                data: None,
                requires_manual_entry: Some(true),
            });
        };

        let Some(account) = self.repo.find_by_id(profile.account_id).await?
        else {
            return Ok(VerificationResult {
                exists: false,
                data: None,
                requires_manual_entry: Some(true),
            });
        };

        let data = PrefillData {
            name: self
                .crypto
                .unprotect(&profile.name_cipher, Classification::Name)?,
            email: self
                .crypto
                .unprotect(&account.email_cipher, Classification::Email)?,
            phone: self
                .crypto
                .unprotect(&profile.phone_cipher, Classification::Phone)?,
            department: profile.department,
            program: profile.program,
        };

        Ok(VerificationResult {
            exists: true,
            data: Some(data),
            requires_manual_entry: None,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use sqlx::{Pool, Postgres, Row};

    use super::*;
    use crate::config::{ReissuePolicy, TokenPolicy};
    use crate::mail::StubNotifier;

    pub(crate) fn request() -> RegistrationRequest {
        RegistrationRequest {
            registration_number: "reg-2024-001".into(),
            application_number: Some("app-2024-001".into()),
            name: "Ada Lovelace".into(),
            gender: Some("F".into()),
            marital_status: None,
            department: "Mathematics".into(),
            program: "BSc".into(),
            national_id: "NG-12345678".into(),
            address: "12 Analytical Row".into(),
            email: "A@Example.com".into(),
            phone: "+2348012345678".into(),
            password: "Abcd1234".into(),
        }
    }

    pub(crate) fn service(
        pool: Pool<Postgres>,
        mail: Arc<dyn Notify>,
    ) -> RegistrationService {
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

        RegistrationService::new(pool, crypto, tokens, mail, audit, config)
    }

    async fn live_token_count(pool: &Pool<Postgres>, identifier: &str) -> i64 {
        sqlx::query(
            r#"SELECT COUNT(*) AS total FROM verification_tokens
                WHERE identifier = $1 AND expires_at > NOW()"#,
        )
        .bind(identifier)
        .fetch_one(pool)
        .await
        .unwrap()
        .try_get("total")
        .unwrap()
    }

    #[sqlx::test]
    async fn test_register_creates_pending_account(pool: Pool<Postgres>) {
        let mail = Arc::new(StubNotifier::default());
        let service = service(pool.clone(), mail.clone());

        let registered = service.register(request()).await.unwrap();
        assert!(registered.requires_verification);

        let account = service
            .repo
            .find_by_id(registered.account_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!account.active);
        assert!(account.verified_at.is_none());

        // Exactly one live token, and one mail dispatched to the
        // canonicalized address.
        assert_eq!(live_token_count(&pool, "a@example.com").await, 1);
        let sent = mail.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "a@example.com");
    }

    #[sqlx::test]
    async fn test_register_duplicate_is_rejected(pool: Pool<Postgres>) {
        let service = service(pool.clone(), Arc::new(StubNotifier::default()));

        service.register(request()).await.unwrap();
        let err = service.register(request()).await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyExists));

        // Account count unchanged.
        let total: i64 = sqlx::query(r#"SELECT COUNT(*) AS total FROM accounts"#)
            .fetch_one(&pool)
            .await
            .unwrap()
            .try_get("total")
            .unwrap();
        assert_eq!(total, 1);
    }

    #[sqlx::test]
    async fn test_insert_race_surfaces_already_exists(pool: Pool<Postgres>) {
        let service = service(pool.clone(), Arc::new(StubNotifier::default()));

        let account = NewAccount {
            email: service
                .crypto
                .protect("a@example.com", Classification::Email)
                .unwrap(),
            role: STUDENT_ROLE.to_owned(),
            password: "phc".into(),
        };
        let profile = NewProfile {
            registration_number: "REG-2024-001".into(),
            application_number: Some("APP-2024-001".into()),
            department: "Mathematics".into(),
            program: "BSc".into(),
            gender: "female".into(),
            marital_status: "unspecified".into(),
            name: service
                .crypto
                .protect("Ada Lovelace", Classification::Name)
                .unwrap(),
            phone: service
                .crypto
                .protect("+2348012345678", Classification::Phone)
                .unwrap(),
            national_id: service
                .crypto
                .protect("NG-12345678", Classification::GovernmentId)
                .unwrap(),
            address: service
                .crypto
                .protect("12 Analytical Row", Classification::Location)
                .unwrap(),
        };

        service.repo.create(&account, &profile).await.unwrap();

        // Straight to the insert, as a loser of a concurrent registration
        // would land after passing the pre-check: the constraint arbitrates.
        let err = service.repo.create(&account, &profile).await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyExists));

        let total: i64 =
            sqlx::query(r#"SELECT COUNT(*) AS total FROM accounts"#)
                .fetch_one(&pool)
                .await
                .unwrap()
                .try_get("total")
                .unwrap();
        assert_eq!(total, 1);
    }

    #[sqlx::test]
    async fn test_dispatch_failure_keeps_account_drops_token(
        pool: Pool<Postgres>,
    ) {
        let mail = Arc::new(StubNotifier {
            fail: true,
            ..Default::default()
        });
        let service = service(pool.clone(), mail);

        // Registration still succeeds.
        let registered = service.register(request()).await.unwrap();
        assert!(registered.requires_verification);

        // The unusable token was invalidated.
        assert_eq!(live_token_count(&pool, "a@example.com").await, 0);
    }

    #[sqlx::test]
    async fn test_register_then_verify_activates(pool: Pool<Postgres>) {
        let service = service(pool.clone(), Arc::new(StubNotifier::default()));

        let registered = service.register(request()).await.unwrap();
        let token: String = sqlx::query(
            r#"SELECT token FROM verification_tokens WHERE identifier = $1"#,
        )
        .bind("a@example.com")
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("token")
        .unwrap();

        service
            .verify_email(
                &token,
                Some(&crate::link::encode_identifier("a@example.com")),
            )
            .await
            .unwrap();

        let account = service
            .repo
            .find_by_id(registered.account_id)
            .await
            .unwrap()
            .unwrap();
        assert!(account.active);
        assert!(account.verified_at.is_some());

        // Token destroyed, exactly one EMAIL_VERIFIED audit event.
        assert_eq!(live_token_count(&pool, "a@example.com").await, 0);
        let events: i64 = sqlx::query(
            r#"SELECT COUNT(*) AS total FROM audit_events WHERE action = 'EMAIL_VERIFIED'"#,
        )
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("total")
        .unwrap();
        assert_eq!(events, 1);
    }

    #[sqlx::test]
    async fn test_resend_on_active_account(pool: Pool<Postgres>) {
        let service = service(pool.clone(), Arc::new(StubNotifier::default()));

        let registered = service.register(request()).await.unwrap();
        service.repo.activate(registered.account_id).await.unwrap();

        let err =
            service.resend_verification("a@example.com").await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyVerified));
    }

    #[sqlx::test]
    async fn test_password_reset_flow(pool: Pool<Postgres>) {
        let service = service(pool.clone(), Arc::new(StubNotifier::default()));

        let registered = service.register(request()).await.unwrap();
        service.request_password_reset("a@example.com").await.unwrap();

        let token: String = sqlx::query(
            r#"SELECT token FROM password_reset_tokens WHERE account_id = $1"#,
        )
        .bind(registered.account_id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("token")
        .unwrap();

        service.reset_password(&token, "Efgh5678").await.unwrap();

        let account = service
            .repo
            .find_by_id(registered.account_id)
            .await
            .unwrap()
            .unwrap();
        assert!(
            service.crypto.pwd.verify_password("Efgh5678", &account.password).is_ok()
        );

        // Unknown address is indistinguishable from a known one.
        service.request_password_reset("ghost@example.com").await.unwrap();
    }

    #[sqlx::test]
    async fn test_lookup_profile(pool: Pool<Postgres>) {
        let service = service(pool.clone(), Arc::new(StubNotifier::default()));
        service.register(request()).await.unwrap();

        let found = service.lookup_profile("reg-2024-001").await.unwrap();
        assert!(found.exists);
        let data = found.data.unwrap();
        assert_eq!(data.name, "Ada Lovelace");
        assert_eq!(data.email, "a@example.com");
        assert_eq!(data.phone, "+2348012345678");

        let missing = service.lookup_profile("REG-0000-000").await.unwrap();
        assert!(!missing.exists);
        assert_eq!(missing.requires_manual_entry, Some(true));
    }
}

//! Handle database requests for accounts and profiles.

use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::account::{Account, Profile};
use crate::crypto::Protected;
use crate::error::{Result, ServerError};

/// Account columns written once at registration.
#[derive(Clone, Debug)]
pub struct NewAccount {
    pub email: Protected,
    pub role: String,
    /// Argon2id PHC string.
    pub password: String,
}

/// Profile columns written once at registration.
#[derive(Clone, Debug)]
pub struct NewProfile {
    pub registration_number: String,
    pub application_number: Option<String>,
    pub department: String,
    pub program: String,
    pub gender: String,
    pub marital_status: String,
    pub name: Protected,
    pub phone: Protected,
    pub national_id: Protected,
    pub address: Protected,
}

#[derive(Clone)]
pub struct AccountRepository {
    pool: PgPool,
}

impl AccountRepository {
    /// Create a new [`AccountRepository`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Whether any existing profile or account claims one of the identifying
    /// attributes.
    ///
    /// Pre-check only; the insert's uniqueness constraints stay the
    /// authoritative arbiter under concurrency.
    pub async fn any_conflict(
        &self,
        registration_number: &str,
        application_number: Option<&str>,
        email_hash: &str,
        phone_hash: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT EXISTS(
                SELECT 1 FROM student_profiles
                    WHERE registration_number = $1
                    OR ($2::TEXT IS NOT NULL AND application_number = $2)
                    OR phone_hash = $3
            ) AS profile_taken,
            EXISTS(
                SELECT 1 FROM accounts WHERE email_hash = $4
            ) AS account_taken"#,
        )
        .bind(registration_number)
        .bind(application_number)
        .bind(phone_hash)
        .bind(email_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<bool, _>("profile_taken")?
            || row.try_get::<bool, _>("account_taken")?)
    }

    /// Atomically create the account (`active = false`) and its profile.
    ///
    /// This transaction is the only atomic boundary of registration; a
    /// uniqueness race inside it surfaces as [`ServerError::AlreadyExists`].
    pub async fn create(
        &self,
        account: &NewAccount,
        profile: &NewProfile,
    ) -> Result<(Uuid, Uuid)> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let account_id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO accounts (id, email_hash, email_cipher, role, active, password)
                VALUES ($1, $2, $3, $4, FALSE, $5)"#,
        )
        .bind(account_id)
        .bind(&account.email.hash)
        .bind(&account.email.cipher)
        .bind(&account.role)
        .bind(&account.password)
        .execute(&mut *tx)
        .await
        .map_err(ServerError::from_insert)?;

        let profile_id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO student_profiles (
                    id, account_id, registration_number, application_number,
                    department, program, gender, marital_status,
                    name_cipher, name_hash, phone_cipher, phone_hash,
                    national_id_cipher, national_id_hash,
                    address_cipher, address_hash)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8,
                    $9, $10, $11, $12, $13, $14, $15, $16)"#,
        )
        .bind(profile_id)
        .bind(account_id)
        .bind(&profile.registration_number)
        .bind(&profile.application_number)
        .bind(&profile.department)
        .bind(&profile.program)
        .bind(&profile.gender)
        .bind(&profile.marital_status)
        .bind(&profile.name.cipher)
        .bind(&profile.name.hash)
        .bind(&profile.phone.cipher)
        .bind(&profile.phone.hash)
        .bind(&profile.national_id.cipher)
        .bind(&profile.national_id.hash)
        .bind(&profile.address.cipher)
        .bind(&profile.address.hash)
        .execute(&mut *tx)
        .await
        .map_err(ServerError::from_insert)?;

        tx.commit().await?;

        Ok((account_id, profile_id))
    }

    /// Find an account by its contact-email search hash.
    pub async fn find_by_email_hash(
        &self,
        email_hash: &str,
    ) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"SELECT id, email_hash, email_cipher, role, active, password,
                    verified_at, created_at
                FROM accounts WHERE email_hash = $1"#,
        )
        .bind(email_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Find an account by id.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"SELECT id, email_hash, email_cipher, role, active, password,
                    verified_at, created_at
                FROM accounts WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Flip `active` and record the verification timestamp.
    pub async fn activate(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE accounts SET active = TRUE, verified_at = $1 WHERE id = $2"#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Rotate the credential digest.
    pub async fn update_password(&self, id: Uuid, password: &str) -> Result<()> {
        sqlx::query(r#"UPDATE accounts SET password = $1 WHERE id = $2"#)
            .bind(password)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Find a profile by its registration number.
    pub async fn find_profile(
        &self,
        registration_number: &str,
    ) -> Result<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"SELECT id, account_id, registration_number, application_number,
                    department, program, gender, marital_status,
                    name_cipher, name_hash, phone_cipher, phone_hash,
                    national_id_cipher, national_id_hash,
                    address_cipher, address_hash, created_at
                FROM student_profiles WHERE registration_number = $1"#,
        )
        .bind(registration_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }
}

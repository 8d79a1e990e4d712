//! Account and profile domain types.

mod repository;
mod service;

pub use repository::*;
pub use service::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Login identity as saved on database.
///
/// Created once with `active = false`; mutated only to flip `active` on
/// verification and to rotate the credential. Never deleted here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    #[serde(skip)]
    pub email_hash: String,
    #[serde(skip)]
    pub email_cipher: String,
    pub role: String,
    pub active: bool,
    #[serde(skip)]
    pub password: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Student profile linked 1:1 to an [`Account`].
///
/// Operational fields (department, program) are plain; every classified
/// field is a ciphertext column paired with its search hash.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub account_id: Uuid,
    pub registration_number: String,
    pub application_number: Option<String>,
    pub department: String,
    pub program: String,
    pub gender: String,
    pub marital_status: String,
    pub name_cipher: String,
    pub name_hash: String,
    pub phone_cipher: String,
    pub phone_hash: String,
    pub national_id_cipher: String,
    pub national_id_hash: String,
    pub address_cipher: String,
    pub address_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Fixed gender vocabulary; unknown input falls back to `Unspecified`
/// instead of erroring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    Unspecified,
}

impl Gender {
    pub fn normalize(input: Option<&str>) -> Self {
        match input.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("m") | Some("male") => Gender::Male,
            Some("f") | Some("female") => Gender::Female,
            _ => Gender::Unspecified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unspecified => "unspecified",
        }
    }
}

/// Fixed marital-status vocabulary, same fallback rule as [`Gender`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaritalStatus {
    Single,
    Married,
    Divorced,
    Widowed,
    Unspecified,
}

impl MaritalStatus {
    pub fn normalize(input: Option<&str>) -> Self {
        match input.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("single") => MaritalStatus::Single,
            Some("married") => MaritalStatus::Married,
            Some("divorced") => MaritalStatus::Divorced,
            Some("widowed") => MaritalStatus::Widowed,
            _ => MaritalStatus::Unspecified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MaritalStatus::Single => "single",
            MaritalStatus::Married => "married",
            MaritalStatus::Divorced => "divorced",
            MaritalStatus::Widowed => "widowed",
            MaritalStatus::Unspecified => "unspecified",
        }
    }
}

/// Profile subset the UI may pre-fill after an identifier lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefillData {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub department: String,
    pub program: String,
}

/// Outcome of an identifier lookup, consumed by the UI collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PrefillData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_manual_entry: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_normalization() {
        assert_eq!(Gender::normalize(Some("M")), Gender::Male);
        assert_eq!(Gender::normalize(Some(" female ")), Gender::Female);
        // Unknown input never errors.
        assert_eq!(Gender::normalize(Some("other")), Gender::Unspecified);
        assert_eq!(Gender::normalize(None), Gender::Unspecified);
    }

    #[test]
    fn test_marital_status_normalization() {
        assert_eq!(
            MaritalStatus::normalize(Some("MARRIED")),
            MaritalStatus::Married
        );
        assert_eq!(
            MaritalStatus::normalize(Some("it's complicated")),
            MaritalStatus::Unspecified
        );
        assert_eq!(MaritalStatus::normalize(None), MaritalStatus::Unspecified);
    }
}

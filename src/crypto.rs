//! Data protection: classified field encryption, search hashes and passwords.

use aes_gcm::aead::{Aead, Nonce, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use validator::{ValidationError, ValidationErrors};
use zeroize::Zeroizing;

use crate::config::{Argon2 as ArgonConfig, PasswordRules};

const NONCE_SIZE: usize = 12;
const KEY_LENGTH: usize = 32;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error(transparent)]
    AesGcm(#[from] aes_gcm::Error),
    #[error("argon2 error: {0}")]
    Argon2(String),

    #[error("hex is not valid")]
    Hex(#[from] hex::FromHexError),
    #[error("encrypted data is not utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("ciphertext length is {value} while at least {excepted} is excepted")]
    CiphertextLength { value: usize, excepted: usize },
}

/// Sensitivity tag scoping both encryption and search hashing.
///
/// The same plaintext under two different classifications never yields the
/// same ciphertext nor the same search hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Name,
    Phone,
    Email,
    GovernmentId,
    Location,
}

impl Classification {
    /// Domain-separation tag mixed into the cipher AAD and the hash.
    fn tag(self) -> &'static [u8] {
        match self {
            Classification::Name => b"name",
            Classification::Phone => b"phone",
            Classification::Email => b"email",
            Classification::GovernmentId => b"government-id",
            Classification::Location => b"location",
        }
    }
}

/// A classified field as stored: opaque ciphertext plus its search hash.
#[derive(Clone, Debug, PartialEq)]
pub struct Protected {
    /// Hex-encoded `nonce || ciphertext`.
    pub cipher: String,
    /// Deterministic digest for equality lookup without decryption.
    pub hash: String,
}

/// Cryptographic manager.
pub struct Crypto {
    cipher: FieldCipher,
    pub pwd: PasswordManager,
    hasher: SearchHasher,
}

impl Crypto {
    /// Create a new [`Crypto`].
    ///
    /// The field key is derived from the master key with Argon2; the salt
    /// doubles as the search-hash pepper.
    pub fn new(
        config: Option<ArgonConfig>,
        master_key: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
    ) -> Result<Self> {
        let key = FieldKey::derive_from_password(master_key, &salt)?;
        let cipher = FieldCipher::new(key);
        let pwd = PasswordManager::new(config)?;
        let hasher = SearchHasher::new(salt);

        Ok(Self {
            cipher,
            pwd,
            hasher,
        })
    }

    /// Encrypt a classified field and compute its paired search hash.
    pub fn protect(
        &self,
        plaintext: impl AsRef<[u8]>,
        class: Classification,
    ) -> Result<Protected> {
        Ok(Protected {
            cipher: self.cipher.encrypt_and_hex(&plaintext, class)?,
            hash: self.hasher.digest(&plaintext, class),
        })
    }

    /// Decrypt a classified field.
    ///
    /// Fails when the ciphertext was tampered with or was written under
    /// another classification.
    pub fn unprotect(
        &self,
        cipher: impl AsRef<[u8]>,
        class: Classification,
    ) -> Result<String> {
        self.cipher.decrypt_from_hex(cipher, class)
    }

    /// Re-derive the search hash for an equality lookup.
    pub fn search_hash(
        &self,
        plaintext: impl AsRef<[u8]>,
        class: Classification,
    ) -> String {
        self.hasher.digest(plaintext, class)
    }

    /// Pepper bytes shared with the link codec.
    pub fn pepper(&self) -> &[u8] {
        self.hasher.pepper()
    }
}

/// FieldKey holds a fixed-size key protected by Zeroizing.
#[derive(Clone)]
pub struct FieldKey(Zeroizing<[u8; KEY_LENGTH]>);

impl FieldKey {
    /// Create from raw bytes (must be 32 bytes).
    fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] =
            bytes.try_into().map_err(|b: Vec<u8>| {
                CryptoError::CiphertextLength {
                    value: b.len(),
                    excepted: KEY_LENGTH,
                }
            })?;
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Derive key from a password + salt using Argon2.
    pub fn derive_from_password(
        password: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
    ) -> Result<Self> {
        let config = ArgonConfig {
            memory_cost: 1024 * 64,
            iterations: 8,
            parallelism: 2,
            hash_length: KEY_LENGTH,
        };

        let mut pwd = PasswordManager::new(Some(config))?;
        pwd.salt(Some(salt.as_ref().to_vec()));
        let phc_hash_string = pwd.hash_password(password)?;
        let password_hash = PasswordHash::new(&phc_hash_string)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;
        let hash = password_hash
            .hash
            .ok_or_else(|| CryptoError::Argon2("empty hash output".into()))?;

        Self::from_bytes(hash.as_bytes().to_vec())
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// AES-256-GCM cipher over classified fields.
///
/// The classification tag rides as associated data, so a ciphertext written
/// under one classification does not decrypt under another.
struct FieldCipher {
    key: FieldKey,
}

impl FieldCipher {
    fn new(key: FieldKey) -> Self {
        Self { key }
    }

    fn encrypt_and_hex(
        &self,
        plaintext: impl AsRef<[u8]>,
        class: Classification,
    ) -> Result<String> {
        let cipher_text = self.encrypt(plaintext, class)?;
        Ok(hex::encode(cipher_text))
    }

    fn decrypt_from_hex(
        &self,
        data: impl AsRef<[u8]>,
        class: Classification,
    ) -> Result<String> {
        let data = hex::decode(data)?;
        let plain = self.decrypt(data, class)?;
        Ok(String::from_utf8(plain)?)
    }

    /// Encrypts data returning raw `nonce || ciphertext` bytes.
    fn encrypt(
        &self,
        plaintext: impl AsRef<[u8]>,
        class: Classification,
    ) -> Result<Vec<u8>> {
        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        // Generate random 96-bit nonce.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&nonce_bytes);

        let cipher_text = cipher.encrypt(
            &nonce,
            Payload {
                msg: plaintext.as_ref(),
                aad: class.tag(),
            },
        )?;

        let mut out = Vec::with_capacity(NONCE_SIZE + cipher_text.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&cipher_text);
        Ok(out)
    }

    /// Decrypt raw data.
    fn decrypt(
        &self,
        data: impl AsRef<[u8]>,
        class: Classification,
    ) -> Result<Vec<u8>> {
        let data = data.as_ref();
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::CiphertextLength {
                value: data.len(),
                excepted: NONCE_SIZE,
            });
        }

        let (nonce_bytes, cipher_text) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        let plain = cipher.decrypt(
            &nonce,
            Payload {
                msg: cipher_text,
                aad: class.tag(),
            },
        )?;

        Ok(plain)
    }
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
    fixed_salt: Option<Vec<u8>>,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self {
            params,
            fixed_salt: None,
        })
    }

    /// Set a fixed salt.
    /// **Used for key derivation only!**
    fn salt(&mut self, salt: Option<Vec<u8>>) {
        self.fixed_salt = salt;
    }

    /// Hash password using Argon2id.
    pub fn hash_password(
        &self,
        password: impl AsRef<[u8]>,
    ) -> std::result::Result<String, CryptoError> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        );
        let salt = match &self.fixed_salt {
            Some(salt) => SaltString::encode_b64(salt)
                .map_err(|e| CryptoError::Argon2(e.to_string()))?,
            None => SaltString::generate(&mut OsRng),
        };
        let hash = argon2
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    fn invalid_password() -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        errors.add(
            "password",
            ValidationError::new("invalid_password")
                .with_message("Invalid password.".into()),
        );
        errors
    }

    /// Verify password against a PHC.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: impl ToString,
    ) -> std::result::Result<(), ValidationErrors> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        );
        let phc_hash = phc_hash.to_string();

        let parsed = PasswordHash::new(&phc_hash)
            .map_err(|_| Self::invalid_password())?;

        argon2
            .verify_password(password.as_ref(), &parsed)
            .map_err(|_| Self::invalid_password())
    }

    /// Whether a stored PHC was produced with other parameters than the
    /// configured ones and should be re-hashed on next successful login.
    pub fn needs_rehash(&self, phc_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(phc_hash) else {
            return true;
        };
        let Ok(params) = Params::try_from(&parsed) else {
            return true;
        };

        parsed.algorithm != argon2::Algorithm::Argon2id.ident()
            || params.m_cost() != self.params.m_cost()
            || params.t_cost() != self.params.t_cost()
            || params.p_cost() != self.params.p_cost()
    }
}

/// Peppered SHA-256 over `pepper || tag || data`, hex-encoded.
struct SearchHasher(Zeroizing<Vec<u8>>);

impl SearchHasher {
    fn new(pepper: impl AsRef<[u8]>) -> Self {
        Self(Zeroizing::new(pepper.as_ref().to_vec()))
    }

    fn digest(&self, data: impl AsRef<[u8]>, class: Classification) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.0);
        hasher.update(class.tag());
        hasher.update(&data);
        let hash = hasher.finalize();

        hex::encode(hash)
    }

    fn pepper(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// Configurable password strength policy.
///
/// Every violated rule is reported; validation never stops at the first
/// failure so the caller can render them together.
#[derive(Clone, Debug)]
pub struct PasswordPolicy {
    rules: PasswordRules,
}

impl PasswordPolicy {
    pub fn new(rules: PasswordRules) -> Self {
        Self { rules }
    }

    pub fn validate(
        &self,
        password: &str,
    ) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if password.chars().count() < self.rules.min_length {
            errors.add(
                "password",
                ValidationError::new("length").with_message(
                    format!(
                        "Password must contain at least {} characters.",
                        self.rules.min_length
                    )
                    .into(),
                ),
            );
        }
        if self.rules.require_lowercase
            && !password.chars().any(|c| c.is_ascii_lowercase())
        {
            errors.add(
                "password",
                ValidationError::new("lowercase").with_message(
                    "Password must contain a lowercase letter.".into(),
                ),
            );
        }
        if self.rules.require_uppercase
            && !password.chars().any(|c| c.is_ascii_uppercase())
        {
            errors.add(
                "password",
                ValidationError::new("uppercase").with_message(
                    "Password must contain an uppercase letter.".into(),
                ),
            );
        }
        if self.rules.require_digit
            && !password.chars().any(|c| c.is_ascii_digit())
        {
            errors.add(
                "password",
                ValidationError::new("digit")
                    .with_message("Password must contain a digit.".into()),
            );
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> Crypto {
        Crypto::new(None, "master_secret", [0x42; 16]).unwrap()
    }

    #[test]
    fn test_protect_roundtrip() {
        let crypto = crypto();

        let protected =
            crypto.protect("Ada Lovelace", Classification::Name).unwrap();
        let plain = crypto
            .unprotect(&protected.cipher, Classification::Name)
            .unwrap();

        assert_eq!(plain, "Ada Lovelace");
    }

    #[test]
    fn test_unprotect_wrong_classification_fails() {
        let crypto = crypto();

        let protected =
            crypto.protect("+2348012345678", Classification::Phone).unwrap();

        assert!(
            crypto
                .unprotect(&protected.cipher, Classification::Email)
                .is_err()
        );
    }

    #[test]
    fn test_search_hash_deterministic_and_scoped() {
        let crypto = crypto();

        let first =
            crypto.protect("a@example.com", Classification::Email).unwrap();
        let second = crypto.search_hash("a@example.com", Classification::Email);
        assert_eq!(first.hash, second);

        // Same plaintext, different classification: no correlation.
        let other = crypto.search_hash("a@example.com", Classification::Phone);
        assert_ne!(second, other);
    }

    #[test]
    fn test_ciphertext_not_deterministic() {
        let crypto = crypto();

        let a =
            crypto.protect("NG-1234", Classification::GovernmentId).unwrap();
        let b =
            crypto.protect("NG-1234", Classification::GovernmentId).unwrap();

        // Fresh nonce every write; only the search hash is deterministic.
        assert_ne!(a.cipher, b.cipher);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_password_hash_and_verify() {
        let crypto = crypto();

        let phc = crypto.pwd.hash_password("Abcd1234").unwrap();
        assert!(crypto.pwd.verify_password("Abcd1234", &phc).is_ok());
        assert!(crypto.pwd.verify_password("Abcd12345", &phc).is_err());
        assert!(!crypto.pwd.needs_rehash(&phc));
    }

    #[test]
    fn test_needs_rehash_on_parameter_change() {
        let weak = PasswordManager::new(Some(ArgonConfig {
            memory_cost: 8 * 1024,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap();
        let phc = weak.hash_password("Abcd1234").unwrap();

        let current = PasswordManager::new(None).unwrap();
        assert!(current.needs_rehash(&phc));
        assert!(current.needs_rehash("not-a-phc-string"));
    }

    #[test]
    fn test_password_policy_accumulates_violations() {
        let policy = PasswordPolicy::new(PasswordRules::default());

        let errors = policy.validate("short").unwrap_err();
        let codes: Vec<_> = errors
            .field_errors()
            .values()
            .flat_map(|issues| issues.iter().map(|i| i.code.to_string()))
            .collect();

        // "short" is too short, all lowercase and digit-free.
        assert!(codes.contains(&"length".to_string()));
        assert!(codes.contains(&"uppercase".to_string()));
        assert!(codes.contains(&"digit".to_string()));
        assert!(!codes.contains(&"lowercase".to_string()));

        assert!(policy.validate("Abcd1234").is_ok());
    }
}

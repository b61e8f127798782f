//! Credential hashing for user passwords and party join secrets.
//!
//! Hashes are stored as `sha256$<salt>$<hex digest>`. The [`CredentialHasher`]
//! trait is the seam where a slower KDF can be plugged in by the host.

use crate::core::error::LedgerError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use subtle::ConstantTimeEq;
use ulid::Ulid;

const SCHEME: &str = "sha256";
pub const MIN_PASSWORD_LEN: usize = 6;

pub trait CredentialHasher: Send + Sync {
    fn hash(&self, secret: &str) -> String;
    fn verify(&self, secret: &str, stored: &str) -> bool;
}

/// Salted SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl Sha256Hasher {
    fn digest(salt: &str, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(b":");
        hasher.update(secret.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl CredentialHasher for Sha256Hasher {
    fn hash(&self, secret: &str) -> String {
        let salt = Ulid::new().to_string();
        format!("{}${}${}", SCHEME, salt, Self::digest(&salt, secret))
    }

    fn verify(&self, secret: &str, stored: &str) -> bool {
        let mut parts = stored.splitn(3, '$');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(SCHEME), Some(salt), Some(expected)) => Self::digest(salt, secret)
                .as_bytes()
                .ct_eq(expected.as_bytes())
                .into(),
            _ => false,
        }
    }
}

/// The hasher used by the stores.
pub fn default_hasher() -> &'static dyn CredentialHasher {
    static HASHER: Sha256Hasher = Sha256Hasher;
    &HASHER
}

/// Password policy for user accounts: minimum length, at least one letter and one digit.
pub fn validate_password(password: &str) -> Result<(), LedgerError> {
    static LETTER: OnceLock<Regex> = OnceLock::new();
    static DIGIT: OnceLock<Regex> = OnceLock::new();

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(LedgerError::BadRequest(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let letter = LETTER.get_or_init(|| Regex::new("[a-zA-Z]").expect("static regex"));
    let digit = DIGIT.get_or_init(|| Regex::new("[0-9]").expect("static regex"));
    if !letter.is_match(password) || !digit.is_match(password) {
        return Err(LedgerError::BadRequest(
            "password must contain letters and digits".into(),
        ));
    }
    Ok(())
}

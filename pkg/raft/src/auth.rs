//! Password hashing and request-validation helpers shared by the RPC layer.
//!
//! The leader hashes a plaintext password exactly once, before the
//! `CREATE_ACCOUNT` entry is ever constructed; the log and every replica's
//! applied state hold only the resulting hash. `verify_password` is the
//! only place a hash is ever compared against a plaintext guess.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::RaftError;

const MIN_PASSWORD_LEN: usize = 8;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email regex is valid")
});

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub fn validate_email(email: &str) -> Result<(), RaftError> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(RaftError::BadRequest(format!("invalid email address: {email}")))
    }
}

pub fn validate_password(password: &str) -> Result<(), RaftError> {
    if password.len() < MIN_PASSWORD_LEN {
        Err(RaftError::BadRequest(format!("password must be at least {MIN_PASSWORD_LEN} characters")))
    } else {
        Ok(())
    }
}

pub fn hash_password(password: &str) -> Result<String, RaftError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| RaftError::BadRequest(format!("could not hash password: {e}")))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else { return false };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_addresses() {
        assert!(is_valid_email("ann@example.com"));
        assert!(is_valid_email("a.b+c@sub.example.org"));
    }

    #[test]
    fn rejects_missing_at_or_domain_dot() {
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("ann@nodot"));
        assert!(!is_valid_email("@example.com"));
    }

    #[test]
    fn short_passwords_rejected() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("longenough1").is_ok());
    }

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_password("pw12pw12").unwrap();
        assert!(verify_password("pw12pw12", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn each_hash_uses_a_distinct_salt() {
        let a = hash_password("pw12pw12").unwrap();
        let b = hash_password("pw12pw12").unwrap();
        assert_ne!(a, b);
    }
}

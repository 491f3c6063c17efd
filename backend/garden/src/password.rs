//! Password checks for donor and admin logins.
//!
//! Accounts provisioned with an Argon2id PHC string are verified with
//! `argon2`. Older accounts still carry a plaintext password; those are
//! compared directly and logged so they can be re-provisioned.

use argon2::{
    password_hash::{PasswordHash, PasswordVerifier},
    Argon2,
};
use tracing::warn;

/// Hash a password using Argon2id, returning the PHC string. Accounts are
/// provisioned outside this service; tests use this to seed hashed ones.
#[cfg(test)]
pub(crate) fn hash_password(password: &str) -> crate::errors::Result<String> {
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| crate::errors::GardenError::Config(format!("Failed to hash password: {e}")))
}

/// Check `candidate` against a stored password.
pub fn verify_password(candidate: &str, stored: &str) -> bool {
    if stored.starts_with("$argon2") {
        return match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(candidate.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!("Stored password hash is malformed: {e}");
                false
            }
        };
    }

    warn!("Account still uses a plaintext password");
    candidate == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_passwords_verify() {
        let hash = hash_password("correct-horse-battery-staple").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct-horse-battery-staple", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn plaintext_passwords_compare_exactly() {
        assert!(verify_password("hunter2", "hunter2"));
        assert!(!verify_password("Hunter2", "hunter2"));
        assert!(!verify_password("", "hunter2"));
    }

    #[test]
    fn malformed_hash_never_matches() {
        assert!(!verify_password("x", "$argon2id$garbage"));
    }
}

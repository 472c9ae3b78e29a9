//! Password hashing with Argon2

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Hash a password using Argon2id
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::Hashing(e.to_string()))
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHash(e.to_string()))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Validate password strength for operator accounts
pub fn validate_password_strength(password: &str) -> Result<(), PasswordValidationError> {
    if password.chars().count() < 8 {
        return Err(PasswordValidationError::TooShort);
    }

    if password.len() > 128 {
        return Err(PasswordValidationError::TooLong);
    }

    if !password.chars().any(|c| c.is_alphabetic()) {
        return Err(PasswordValidationError::MissingLetter);
    }

    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordValidationError::MissingDigit);
    }

    if is_common_password(password) {
        return Err(PasswordValidationError::TooCommon);
    }

    Ok(())
}

fn is_common_password(password: &str) -> bool {
    const COMMON_PASSWORDS: &[&str] = &[
        "password1",
        "password123",
        "qwerty123",
        "abc12345",
        "abcd1234",
        "welcome1",
        "welcome123",
        "admin123",
        "12345678a",
        "iloveyou1",
        "1q2w3e4r",
        "1qaz2wsx",
        "zaq12wsx",
        "qwerty12",
        "passw0rd",
        "p@ssw0rd",
    ];

    let lower = password.to_lowercase();
    COMMON_PASSWORDS.contains(&lower.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("Password hashing failed: {0}")]
    Hashing(String),
    #[error("Invalid password hash: {0}")]
    InvalidHash(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PasswordValidationError {
    #[error("Password must be at least 8 characters")]
    TooShort,
    #[error("Password must be at most 128 characters")]
    TooLong,
    #[error("Password must contain at least one letter")]
    MissingLetter,
    #[error("Password must contain at least one digit")]
    MissingDigit,
    #[error("This password is too common - please choose a unique password")]
    TooCommon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let password = "Operator2024";
        let hash = hash_password(password).unwrap();

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_invalid_hash_is_an_error() {
        assert!(matches!(
            verify_password("anything", "not-a-phc-string"),
            Err(PasswordError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_password_validation() {
        assert_eq!(
            validate_password_strength("short1"),
            Err(PasswordValidationError::TooShort)
        );
        assert_eq!(
            validate_password_strength("onlyletters"),
            Err(PasswordValidationError::MissingDigit)
        );
        assert_eq!(
            validate_password_strength("1234567890"),
            Err(PasswordValidationError::MissingLetter)
        );
        assert_eq!(
            validate_password_strength(&"a1".repeat(65)),
            Err(PasswordValidationError::TooLong)
        );
        assert!(validate_password_strength("Оператор2024").is_ok());
        assert!(validate_password_strength("linedesk42").is_ok());
    }

    #[test]
    fn test_common_password_detection() {
        assert_eq!(
            validate_password_strength("Password123"),
            Err(PasswordValidationError::TooCommon)
        );
        assert_eq!(
            validate_password_strength("P@ssw0rd"),
            Err(PasswordValidationError::TooCommon)
        );
    }
}

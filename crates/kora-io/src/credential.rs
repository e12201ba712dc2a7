//! Bearer credential for the backend API.
//!
//! The token is read from an environment variable at start-up and never
//! written to logs.

use std::fmt;
use thiserror::Error;

pub const DEFAULT_TOKEN_ENV: &str = "KORA_API_TOKEN";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("environment variable {0} is not set")]
    Missing(String),

    #[error("environment variable {0} is empty")]
    Empty(String),

    #[error("token contains whitespace or control characters")]
    InvalidFormat,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(raw: impl Into<String>) -> Result<Self, CredentialError> {
        let raw = raw.into();
        let token = raw.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty(String::new()));
        }
        if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CredentialError::InvalidFormat);
        }
        Ok(Self(token.to_string()))
    }

    /// Read the token from `var`.
    pub fn from_env(var: &str) -> Result<Self, CredentialError> {
        let raw = std::env::var(var).map_err(|_| CredentialError::Missing(var.to_string()))?;
        Self::new(raw).map_err(|e| match e {
            CredentialError::Empty(_) => CredentialError::Empty(var.to_string()),
            other => other,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_never_contains_the_token() {
        let token = BearerToken::new("eyJhbGciOiJIUzI1NiJ9.secret").unwrap();
        let printed = format!("{:?}", token);
        assert!(!printed.contains("secret"));
        assert_eq!(token.as_str(), "eyJhbGciOiJIUzI1NiJ9.secret");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let token = BearerToken::new("  abc.def\n").unwrap();
        assert_eq!(token.as_str(), "abc.def");
    }

    #[test]
    fn blank_and_malformed_tokens_are_rejected() {
        assert!(matches!(BearerToken::new("   "), Err(CredentialError::Empty(_))));
        assert_eq!(
            BearerToken::new("two words"),
            Err(CredentialError::InvalidFormat)
        );
    }

    #[test]
    fn from_env_reports_the_variable_name() {
        let var = "KORA_TEST_TOKEN_THAT_IS_NEVER_SET";
        assert_eq!(
            BearerToken::from_env(var),
            Err(CredentialError::Missing(var.to_string()))
        );

        let var = "KORA_TEST_TOKEN_FROM_ENV";
        std::env::set_var(var, "token-123");
        assert_eq!(BearerToken::from_env(var).unwrap().as_str(), "token-123");
        std::env::set_var(var, "");
        assert_eq!(
            BearerToken::from_env(var),
            Err(CredentialError::Empty(var.to_string()))
        );
        std::env::remove_var(var);
    }
}

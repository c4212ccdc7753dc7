use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use thiserror::Error;

const BASIC_PREFIX: &str = "Basic ";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("unsupported authorization scheme")]
    UnsupportedScheme,
    #[error("malformed credentials: {0}")]
    Malformed(String),
}

/// A user/password pair carried in the `authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Encodes as `Basic <base64(user:password)>`.
    pub fn to_header_value(&self) -> String {
        let raw = format!("{}:{}", self.user, self.password);
        format!("{}{}", BASIC_PREFIX, STANDARD.encode(raw))
    }

    pub fn from_header_value(value: &str) -> Result<Self, CredentialsError> {
        let encoded = value
            .strip_prefix(BASIC_PREFIX)
            .ok_or(CredentialsError::UnsupportedScheme)?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CredentialsError::Malformed(e.to_string()))?;
        let decoded =
            String::from_utf8(decoded).map_err(|e| CredentialsError::Malformed(e.to_string()))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| CredentialsError::Malformed("missing ':' separator".to_string()))?;
        Ok(Credentials::new(user, password))
    }
}

// Never print the password.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

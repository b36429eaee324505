//! PKCS#12 export passwords
//!
//! Passwords are held in a `secrecy` container so they never show up in
//! debug output or logs and are zeroized on drop.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::configs::{ExportConfig, PasswordPolicy};
use crate::error::IssuanceError;

/// 18 random bytes encode to 24 base64url characters
const GENERATED_PASSWORD_BYTES: usize = 18;

pub struct ExportPassword {
    secret: SecretString,
}

impl ExportPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            secret: SecretString::from(password.into()),
        }
    }

    /// Fresh password from the OpenSSL CSPRNG
    pub fn generate() -> Result<Self, IssuanceError> {
        let mut bytes = [0u8; GENERATED_PASSWORD_BYTES];
        openssl::rand::rand_bytes(&mut bytes)
            .map_err(|e| IssuanceError::packaging(format!("random source failed: {}", e)))?;
        Ok(Self::new(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl Clone for ExportPassword {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for ExportPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportPassword")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Hands out the password for each bundle according to [`PasswordPolicy`]
#[derive(Debug, Clone)]
pub enum PasswordSource {
    PerRequest,
    Fixed(ExportPassword),
}

impl PasswordSource {
    pub fn from_config(config: &ExportConfig) -> Result<Self, IssuanceError> {
        match config.password_policy {
            PasswordPolicy::PerRequest => Ok(PasswordSource::PerRequest),
            PasswordPolicy::Fixed => match config.fixed_password.as_deref() {
                Some(password) if !password.is_empty() => {
                    Ok(PasswordSource::Fixed(ExportPassword::new(password)))
                }
                _ => Err(IssuanceError::configuration(
                    "password_policy = \"fixed\" requires a non-empty fixed_password",
                )),
            },
        }
    }

    /// Password for the next bundle, and whether the caller must be told about it
    pub fn next(&self) -> Result<(ExportPassword, bool), IssuanceError> {
        match self {
            PasswordSource::PerRequest => Ok((ExportPassword::generate()?, true)),
            PasswordSource::Fixed(password) => Ok((password.clone(), false)),
        }
    }
}

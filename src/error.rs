//! Issuance error taxonomy
//!
//! Every failure of the issuance pipeline is reported as an [`IssuanceError`].
//! The variants map one-to-one onto the pipeline stages, and [`ErrorKind`]
//! gives transport layers an HTTP-agnostic classification to map from.

use thiserror::Error;

/// Upper bound on diagnostic text carried by an error, in characters.
pub const MAX_DIAGNOSTIC_LEN: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Generation,
    Signing,
    Packaging,
    NotFound,
    InvalidInput,
}

impl ErrorKind {
    /// Whether the failure originates on the service side rather than with the caller.
    pub fn is_server_error(self) -> bool {
        !matches!(self, ErrorKind::NotFound | ErrorKind::InvalidInput)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Generation => "generation",
            ErrorKind::Signing => "signing",
            ErrorKind::Packaging => "packaging",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
        }
    }
}

#[derive(Debug, Error)]
pub enum IssuanceError {
    /// CA resources are missing or unreadable. Affects every request identically.
    #[error("CA configuration error: {0}")]
    Configuration(String),

    #[error("key generation failed: {0}")]
    Generation(String),

    #[error("certificate signing failed: {0}")]
    Signing(String),

    #[error("bundle packaging failed: {0}")]
    Packaging(String),

    /// Download identifier unknown, already consumed, or expired.
    #[error("certificate not found or expired")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidInput(String),
}

impl IssuanceError {
    pub fn configuration(detail: impl AsRef<str>) -> Self {
        IssuanceError::Configuration(truncate_diagnostic(detail.as_ref()))
    }

    pub fn generation(detail: impl AsRef<str>) -> Self {
        IssuanceError::Generation(truncate_diagnostic(detail.as_ref()))
    }

    pub fn signing(detail: impl AsRef<str>) -> Self {
        IssuanceError::Signing(truncate_diagnostic(detail.as_ref()))
    }

    pub fn packaging(detail: impl AsRef<str>) -> Self {
        IssuanceError::Packaging(truncate_diagnostic(detail.as_ref()))
    }

    pub fn invalid_input(detail: impl AsRef<str>) -> Self {
        IssuanceError::InvalidInput(truncate_diagnostic(detail.as_ref()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IssuanceError::Configuration(_) => ErrorKind::Configuration,
            IssuanceError::Generation(_) => ErrorKind::Generation,
            IssuanceError::Signing(_) => ErrorKind::Signing,
            IssuanceError::Packaging(_) => ErrorKind::Packaging,
            IssuanceError::NotFound => ErrorKind::NotFound,
            IssuanceError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Trim and cut diagnostic output to [`MAX_DIAGNOSTIC_LEN`] characters.
pub fn truncate_diagnostic(detail: &str) -> String {
    let detail = detail.trim();
    match detail.char_indices().nth(MAX_DIAGNOSTIC_LEN) {
        Some((cut, _)) => detail[..cut].to_string(),
        None => detail.to_string(),
    }
}

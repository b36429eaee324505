//! Protocol Module
//!
//! JSON request/response types of the HTTP interface and the form validation
//! applied before an identity reaches the issuer.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, IssuanceError};
use crate::identity::IdentityRequest;
use crate::issuer::Issued;

// Constant pattern, checked by the tests below
static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles"));

const NAME_MIN_CHARS: usize = 3;
const NAME_MAX_CHARS: usize = 100;
const ADDRESS_MIN_CHARS: usize = 10;

/// Body of `POST /validate`
///
/// Field names follow the web form (`nome`, `telefone`, `endereco`). Missing
/// fields deserialize as empty strings and are reported by [`validate`].
///
/// [`validate`]: IssueRequest::validate
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IssueRequest {
    pub nome: String,
    pub email: String,
    pub telefone: String,
    pub cpf: String,
    pub endereco: String,
}

/// Validation failures keyed by form field
pub type FieldErrors = BTreeMap<&'static str, String>;

impl IssueRequest {
    /// Check every field and build the identity handed to the issuer
    ///
    /// All fields are checked; the error carries one message per bad field.
    pub fn validate(&self) -> Result<IdentityRequest, FieldErrors> {
        let mut errors = FieldErrors::new();

        let name = self.nome.trim();
        let name_len = name.chars().count();
        if name_len < NAME_MIN_CHARS {
            errors.insert("nome", "Nome deve ter pelo menos 3 caracteres".to_string());
        } else if name_len > NAME_MAX_CHARS {
            errors.insert("nome", "Nome deve ter no máximo 100 caracteres".to_string());
        }

        let email = self.email.trim();
        if !email.is_ascii() || !EMAIL_PATTERN.is_match(email) {
            errors.insert("email", "E-mail inválido".to_string());
        }

        let phone_digits = digits(&self.telefone);
        if !(10..=11).contains(&phone_digits.len()) {
            errors.insert("telefone", "Telefone deve ter 10 ou 11 dígitos".to_string());
        }

        let cpf_digits = digits(&self.cpf);
        if cpf_digits.len() != 11 {
            errors.insert("cpf", "CPF inválido".to_string());
        }

        let address = self.endereco.trim();
        if address.chars().count() < ADDRESS_MIN_CHARS {
            errors.insert(
                "endereco",
                "Endereço deve ter pelo menos 10 caracteres".to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(IdentityRequest {
            name: name.to_string(),
            email: email.to_string(),
            phone: phone_digits,
            national_id: cpf_digits,
            address: address.to_string(),
        })
    }
}

fn digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// Body returned by `POST /validate`
#[derive(Debug, Deserialize, Serialize)]
pub struct IssueResponse {
    pub download_id: String,
    pub ttl_seconds: u64,
    /// Only present when the bundle password was generated for this request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_password: Option<String>,
}

impl From<Issued> for IssueResponse {
    fn from(issued: Issued) -> Self {
        Self {
            download_id: issued.download_id,
            ttl_seconds: issued.ttl_seconds,
            export_password: issued
                .export_password
                .map(|password| password.expose().to_string()),
        }
    }
}

/// Uniform error body
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl ErrorResponse {
    pub fn from_error(error: &IssuanceError) -> Self {
        let detail = match error {
            IssuanceError::NotFound => "Certificado não encontrado ou expirado".to_string(),
            other => other.to_string(),
        };
        Self {
            detail,
            kind: error.kind().as_str().to_string(),
            fields: BTreeMap::new(),
        }
    }

    /// Body that could not be parsed as a form
    pub fn malformed_body(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            kind: ErrorKind::InvalidInput.as_str().to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn invalid_fields(errors: FieldErrors) -> Self {
        Self {
            detail: "Dados inválidos".to_string(),
            kind: ErrorKind::InvalidInput.as_str().to_string(),
            fields: errors
                .into_iter()
                .map(|(field, message)| (field.to_string(), message))
                .collect(),
        }
    }
}

/// Body returned by `GET /health`
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    /// UTC timestamp, RFC 3339
    pub time: String,
    pub ca_ready: bool,
}

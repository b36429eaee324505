//! Identity requests and certificate subject sanitization
//!
//! Only the name and email of an [`IdentityRequest`] reach the certificate.
//! Names are normalized to a safe literal before use: characters with meaning
//! in distinguished-name syntax (`/`, `\`, `=`, `+`, `,`, ...) become `-`,
//! control characters and whitespace runs collapse to a single space. The
//! normalization is lossy; `A/B\C` and `A-B-C` produce the same subject.

use crate::error::IssuanceError;

/// X.509 upper bound for commonName (RFC 5280 ub-common-name)
const MAX_COMMON_NAME_LEN: usize = 64;
/// RFC 5280 ub-emailaddress-length
const MAX_EMAIL_LEN: usize = 255;

const RESERVED_NAME_CHARS: &[char] = &['/', '\\', '=', '+', ',', ';', '<', '>', '"', '#'];
const RESERVED_EMAIL_CHARS: &[char] = &['/', '\\', ','];

/// Already-validated personal data submitted for issuance
#[derive(Debug, Clone)]
pub struct IdentityRequest {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub national_id: String,
    pub address: String,
}

impl IdentityRequest {
    /// Request carrying only the fields that end up in the certificate
    pub fn named(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            phone: String::new(),
            national_id: String::new(),
            address: String::new(),
        }
    }

    pub fn subject(&self) -> Result<SubjectFields, IssuanceError> {
        SubjectFields::new(&self.name, &self.email)
    }
}

/// Sanitized per-request subject fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFields {
    pub common_name: String,
    pub email: String,
}

impl SubjectFields {
    pub fn new(name: &str, email: &str) -> Result<Self, IssuanceError> {
        let common_name = sanitize_common_name(name);
        if common_name.is_empty() {
            return Err(IssuanceError::generation(
                "subject name is empty after sanitization",
            ));
        }

        let email = email.trim();
        if email.is_empty() || email.len() > MAX_EMAIL_LEN {
            return Err(IssuanceError::invalid_input("email has invalid length"));
        }
        // emailAddress is an IA5String
        if !email.is_ascii() {
            return Err(IssuanceError::invalid_input("email must be ASCII"));
        }
        if email
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || RESERVED_EMAIL_CHARS.contains(&c))
        {
            return Err(IssuanceError::invalid_input(
                "email contains reserved characters",
            ));
        }

        Ok(Self {
            common_name,
            email: email.to_string(),
        })
    }
}

pub fn sanitize_common_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;

    for c in name.chars() {
        if c.is_whitespace() || c.is_control() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if RESERVED_NAME_CHARS.contains(&c) {
            out.push('-');
        } else {
            out.push(c);
        }
    }

    match out.char_indices().nth(MAX_COMMON_NAME_LEN) {
        Some((cut, _)) => out[..cut].trim_end().to_string(),
        None => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_separators_become_dashes() {
        assert_eq!(sanitize_common_name("A/B\\C"), "A-B-C");
    }

    #[test]
    fn test_subject_syntax_characters_are_neutralized() {
        assert_eq!(
            sanitize_common_name("Eve/CN=root,O=Evil+OU=x"),
            "Eve-CN-root-O-Evil-OU-x"
        );
    }

    #[test]
    fn test_whitespace_and_control_characters_collapse() {
        assert_eq!(sanitize_common_name("  Maria \n\t Silva\r\n"), "Maria Silva");
        assert_eq!(sanitize_common_name("Jo\u{0}ao"), "Jo ao");
    }

    #[test]
    fn test_long_names_are_capped() {
        let name = "a".repeat(200);
        assert_eq!(sanitize_common_name(&name).chars().count(), MAX_COMMON_NAME_LEN);
    }

    #[test]
    fn test_accented_names_survive() {
        let subject = IdentityRequest::named("José da Conceição", "jose@example.com")
            .subject()
            .unwrap();
        assert_eq!(subject.common_name, "José da Conceição");
    }

    #[test]
    fn test_blank_name_is_rejected() {
        let err = SubjectFields::new(" \n ", "maria@example.com").unwrap_err();
        assert!(matches!(err, IssuanceError::Generation(_)));
    }

    #[test]
    fn test_email_with_separator_is_rejected() {
        for email in ["maria@example.com/CN=x", "a\nb@example.com", "a,b@example.com"] {
            let err = SubjectFields::new("Maria", email).unwrap_err();
            assert!(matches!(err, IssuanceError::InvalidInput(_)), "{email}");
        }
    }

    #[test]
    fn test_plus_addressed_email_is_accepted() {
        for email in ["maria+cert@example.com", "a=b@example.com"] {
            let subject = SubjectFields::new("Maria", email).unwrap();
            assert_eq!(subject.email, email);
        }
    }

    #[test]
    fn test_non_ascii_email_is_invalid_input() {
        let err = SubjectFields::new("João", "joão@exemplo.com").unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidInput(_)));
    }
}

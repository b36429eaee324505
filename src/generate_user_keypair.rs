//! Client key and certificate signing request generation
//!
//! Produces the per-request RSA key and the CSR submitted to the signing
//! unit. The subject is assembled entry by entry with `X509NameBuilder`, never
//! parsed from a `/C=../CN=..` string, so the values cannot smuggle in extra
//! name components.
//!
//! # Subject layout
//! ```text
//! C=<country> ST=<state> L=<locality> O=<organization> OU=<unit>
//! CN=<sanitized name> emailAddress=<email>
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509Req};

use crate::configs::SubjectDefaults;
use crate::error::IssuanceError;
use crate::identity::SubjectFields;
use crate::work_area::write_secret_file;

const RSA_KEY_SIZE_MIN: u32 = 2048;

/// Key and CSR of one issuance request, both also written to its work area
pub struct GeneratedRequest {
    pub private_key: PKey<Private>,
    pub csr: X509Req,
    pub csr_path: PathBuf,
}

/// Builder for an RSA client key and its certificate signing request
///
/// # Example
/// ```rust,no_run
/// # use pfx_issuer::generate_user_keypair::RsaUserRequestBuilder;
/// # use pfx_issuer::configs::SubjectDefaults;
/// # use pfx_issuer::identity::SubjectFields;
/// # fn example() -> Result<(), pfx_issuer::error::IssuanceError> {
/// let subject = SubjectFields::new("Maria Silva", "maria@example.com")?;
/// let (key, csr) = RsaUserRequestBuilder::new(&subject)
///     .defaults(&SubjectDefaults::default())
///     .key_bits(2048)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RsaUserRequestBuilder {
    common_name: String,
    email: String,
    organization: String,
    organizational_unit: String,
    locality: String,
    state: String,
    country: String,
    key_bits: u32,
}

impl RsaUserRequestBuilder {
    pub fn new(subject: &SubjectFields) -> Self {
        Self {
            common_name: subject.common_name.clone(),
            email: subject.email.clone(),
            organization: String::new(),
            organizational_unit: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            key_bits: RSA_KEY_SIZE_MIN,
        }
    }

    /// Fill the fixed O/OU/L/ST/C fields
    pub fn defaults(mut self, defaults: &SubjectDefaults) -> Self {
        self.organization = defaults.organization.clone();
        self.organizational_unit = defaults.organizational_unit.clone();
        self.locality = defaults.locality.clone();
        self.state = defaults.state.clone();
        self.country = defaults.country.clone();
        self
    }

    /// RSA modulus size; values below 2048 are raised to 2048
    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits.max(RSA_KEY_SIZE_MIN);
        self
    }

    /// Generate the key pair and a CSR signed with it
    pub fn build(self) -> Result<(PKey<Private>, X509Req), IssuanceError> {
        let rsa = openssl::rsa::Rsa::generate(self.key_bits).map_err(|e| {
            IssuanceError::generation(format!("Failed to generate RSA keypair: {}", e))
        })?;
        let private_key = PKey::from_rsa(rsa).map_err(|e| {
            IssuanceError::generation(format!("Failed to create private key: {}", e))
        })?;

        let mut name_builder = X509Name::builder().map_err(|e| {
            IssuanceError::generation(format!("Failed to create name builder: {}", e))
        })?;
        let entries = [
            (Nid::COUNTRYNAME, &self.country, "country"),
            (Nid::STATEORPROVINCENAME, &self.state, "state/province"),
            (Nid::LOCALITYNAME, &self.locality, "locality"),
            (Nid::ORGANIZATIONNAME, &self.organization, "organization"),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit, "organizational unit"),
            (Nid::COMMONNAME, &self.common_name, "CN"),
            (Nid::PKCS9_EMAILADDRESS, &self.email, "emailAddress"),
        ];
        for (nid, value, label) in entries {
            if value.is_empty() {
                continue;
            }
            name_builder.append_entry_by_nid(nid, value).map_err(|e| {
                IssuanceError::generation(format!("Failed to set {}: {}", label, e))
            })?;
        }
        let subject_name = name_builder.build();

        let mut req_builder = X509Req::builder().map_err(|e| {
            IssuanceError::generation(format!("Failed to create CSR builder: {}", e))
        })?;
        req_builder
            .set_version(0)
            .map_err(|e| IssuanceError::generation(format!("Failed to set version: {}", e)))?;
        req_builder
            .set_subject_name(&subject_name)
            .map_err(|e| IssuanceError::generation(format!("Failed to set subject: {}", e)))?;
        req_builder.set_pubkey(&private_key).map_err(|e| {
            IssuanceError::generation(format!("Failed to set public key: {}", e))
        })?;
        req_builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| IssuanceError::generation(format!("Failed to sign CSR: {}", e)))?;

        Ok((private_key, req_builder.build()))
    }
}

/// Generate the key and CSR and write both into a work area
///
/// The key goes to `key_path` as PKCS#8 PEM with mode 0600.
pub fn generate(
    subject: &SubjectFields,
    defaults: &SubjectDefaults,
    key_bits: u32,
    key_path: &Path,
    csr_path: &Path,
) -> Result<GeneratedRequest, IssuanceError> {
    let (private_key, csr) = RsaUserRequestBuilder::new(subject)
        .defaults(defaults)
        .key_bits(key_bits)
        .build()?;

    let key_pem = private_key
        .private_key_to_pem_pkcs8()
        .map_err(|e| IssuanceError::generation(format!("Failed to encode key: {}", e)))?;
    write_secret_file(key_path, &key_pem)
        .map_err(|e| IssuanceError::generation(format!("Failed to write key: {}", e)))?;

    let csr_pem = csr
        .to_pem()
        .map_err(|e| IssuanceError::generation(format!("Failed to encode CSR: {}", e)))?;
    fs::write(csr_path, csr_pem)
        .map_err(|e| IssuanceError::generation(format!("Failed to write CSR: {}", e)))?;

    Ok(GeneratedRequest {
        private_key,
        csr,
        csr_path: csr_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRequest;
    use crate::work_area::WorkArea;

    fn entry(name: &openssl::x509::X509NameRef, nid: Nid) -> Vec<String> {
        name.entries_by_nid(nid)
            .map(|e| String::from_utf8_lossy(e.data().as_slice()).into_owned())
            .collect()
    }

    #[test]
    fn test_subject_carries_defaults_name_and_email() {
        let subject = IdentityRequest::named("Maria Silva", "maria@example.com")
            .subject()
            .unwrap();
        let (key, csr) = RsaUserRequestBuilder::new(&subject)
            .defaults(&SubjectDefaults::default())
            .build()
            .unwrap();

        assert!(csr.verify(&key).unwrap());
        let name = csr.subject_name();
        assert_eq!(entry(name, Nid::COMMONNAME), vec!["Maria Silva"]);
        assert_eq!(entry(name, Nid::PKCS9_EMAILADDRESS), vec!["maria@example.com"]);
        assert_eq!(entry(name, Nid::COUNTRYNAME), vec!["BR"]);
        assert_eq!(entry(name, Nid::ORGANIZATIONNAME), vec!["Aurora-Teste"]);
    }

    #[test]
    fn test_separator_name_yields_single_common_name() {
        let subject = IdentityRequest::named("A/B\\C", "a@example.com")
            .subject()
            .unwrap();
        let (_, csr) = RsaUserRequestBuilder::new(&subject)
            .defaults(&SubjectDefaults::default())
            .build()
            .unwrap();

        let name = csr.subject_name();
        assert_eq!(entry(name, Nid::COMMONNAME), vec!["A-B-C"]);
        assert_eq!(name.entries().count(), 7);
    }

    #[test]
    fn test_small_key_sizes_are_raised() {
        let subject = SubjectFields::new("Maria", "maria@example.com").unwrap();
        let (key, _) = RsaUserRequestBuilder::new(&subject)
            .key_bits(512)
            .build()
            .unwrap();
        assert_eq!(key.bits(), 2048);
    }

    #[test]
    fn test_generate_writes_key_and_csr() {
        let root = tempfile::tempdir().unwrap();
        let work = WorkArea::create_in(root.path()).unwrap();
        let subject = SubjectFields::new("Maria Silva", "maria@example.com").unwrap();

        let generated = generate(
            &subject,
            &SubjectDefaults::default(),
            2048,
            &work.key_path(),
            &work.csr_path(),
        )
        .unwrap();

        let key_on_disk = PKey::private_key_from_pem(&fs::read(work.key_path()).unwrap()).unwrap();
        assert!(key_on_disk.public_eq(&generated.private_key));
        let csr_on_disk = X509Req::from_pem(&fs::read(&generated.csr_path).unwrap()).unwrap();
        assert_eq!(csr_on_disk.to_der().unwrap(), generated.csr.to_der().unwrap());
    }
}

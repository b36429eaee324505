//! Bundle packager: private key + certificate + trust chain → PKCS#12

use std::fs;
use std::path::{Path, PathBuf};

use openssl::pkcs12::{ParsedPkcs12_2, Pkcs12};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;

use crate::error::IssuanceError;
use crate::export_password::ExportPassword;
use crate::work_area::write_secret_file;

/// CA certificates embedded in every bundle, loaded once at startup
#[derive(Clone)]
pub struct TrustChain {
    certificates: Vec<X509>,
}

impl TrustChain {
    pub fn load(path: &Path) -> Result<Self, IssuanceError> {
        let pem = fs::read(path).map_err(|e| {
            IssuanceError::configuration(format!(
                "cannot read trust chain {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_pem(&pem).map_err(|e| match e {
            IssuanceError::Packaging(message) => IssuanceError::configuration(message),
            other => other,
        })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, IssuanceError> {
        let certificates = X509::stack_from_pem(pem)
            .map_err(|e| IssuanceError::packaging(format!("malformed trust chain: {}", e)))?;
        if certificates.is_empty() {
            return Err(IssuanceError::packaging("trust chain contains no certificates"));
        }
        Ok(Self { certificates })
    }

    pub fn certificates(&self) -> &[X509] {
        &self.certificates
    }
}

/// Build the PKCS#12 archive in memory
pub fn build_pfx(
    private_key: &PKey<Private>,
    certificate: &X509,
    chain: &TrustChain,
    password: &ExportPassword,
    friendly_name: &str,
) -> Result<Vec<u8>, IssuanceError> {
    if !certificate
        .public_key()
        .map(|public| public.public_eq(private_key))
        .unwrap_or(false)
    {
        return Err(IssuanceError::packaging(
            "certificate does not match the private key",
        ));
    }

    let mut ca_stack = Stack::new().map_err(|e| IssuanceError::packaging(e.to_string()))?;
    for ca in chain.certificates() {
        ca_stack
            .push(ca.clone())
            .map_err(|e| IssuanceError::packaging(e.to_string()))?;
    }

    let pkcs12 = Pkcs12::builder()
        .name(friendly_name)
        .pkey(private_key)
        .cert(certificate)
        .ca(ca_stack)
        .build2(password.expose())
        .map_err(|e| IssuanceError::packaging(format!("PKCS#12 export failed: {}", e)))?;
    pkcs12
        .to_der()
        .map_err(|e| IssuanceError::packaging(format!("PKCS#12 encoding failed: {}", e)))
}

/// Build the archive and write it to `out` (owner-readable only)
pub fn package(
    private_key: &PKey<Private>,
    certificate: &X509,
    chain: &TrustChain,
    password: &ExportPassword,
    friendly_name: &str,
    out: &Path,
) -> Result<PathBuf, IssuanceError> {
    let der = build_pfx(private_key, certificate, chain, password, friendly_name)?;
    write_secret_file(out, &der)
        .map_err(|e| IssuanceError::packaging(format!("cannot write bundle: {}", e)))?;
    Ok(out.to_path_buf())
}

/// Open a PKCS#12 archive
pub fn load_pfx(der: &[u8], password: &str) -> Result<ParsedPkcs12_2, IssuanceError> {
    Pkcs12::from_der(der)
        .and_then(|pkcs12| pkcs12.parse2(password))
        .map_err(|e| IssuanceError::packaging(format!("cannot open PKCS#12: {}", e)))
}

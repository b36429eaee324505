//! Signing backends
//!
//! A [`SigningBackend`] turns a CSR into a certificate signed by the
//! intermediate CA. Backends are not required to be safe under concurrent
//! use: [`crate::signing_unit::SigningUnit`] is their only caller and never
//! runs two signings at once.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use chrono::{Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Req, X509};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::ca_index::{oneline_subject, CaIndex, IndexRecord};
use crate::configs::{CaBackendKind, CaConfig};
use crate::error::IssuanceError;
use crate::pki_generator::sign_user_request;

/// Inputs of one signing operation
pub struct SigningRequest<'a> {
    pub csr: &'a X509Req,
    /// The same CSR, PEM-encoded on disk
    pub csr_path: &'a Path,
    /// Where the backend may place its output
    pub cert_path: &'a Path,
}

#[async_trait]
pub trait SigningBackend: Send {
    fn name(&self) -> &'static str;

    async fn sign(&mut self, request: &SigningRequest<'_>) -> Result<X509, IssuanceError>;
}

/// Build the backend selected by `config`
///
/// Missing or unreadable CA resources are reported as
/// [`IssuanceError::Configuration`].
pub fn from_config(config: &CaConfig) -> Result<Box<dyn SigningBackend>, IssuanceError> {
    match config.backend {
        CaBackendKind::Local => Ok(Box::new(LocalCaBackend::open(
            &config.config_path,
            config.validity_days,
            config.unique_subject,
        )?)),
        CaBackendKind::OpensslCli => Ok(Box::new(OpensslCliBackend::new(
            config.openssl_binary.clone(),
            config.config_path.clone(),
            config.validity_days,
        )?)),
    }
}

// ================= Local (in-process) backend =================

/// `ca.toml` descriptor of a local CA directory. Paths are relative to it.
#[derive(Debug, Deserialize)]
struct LocalCaDescriptor {
    key_path: PathBuf,
    cert_path: PathBuf,
    serial_path: PathBuf,
    index_path: PathBuf,
}

/// Signs in-process; the RSA signature and the index fsyncs run on the
/// blocking pool so the signing timeout can fire while they are in progress
pub struct LocalCaBackend {
    state: Arc<Mutex<LocalCaState>>,
}

struct LocalCaState {
    ca_key: PKey<Private>,
    ca_cert: X509,
    index: CaIndex,
    validity_days: u32,
    unique_subject: bool,
}

impl LocalCaBackend {
    pub fn open(
        descriptor_path: &Path,
        validity_days: u32,
        unique_subject: bool,
    ) -> Result<Self, IssuanceError> {
        let raw = fs::read_to_string(descriptor_path).map_err(|e| {
            IssuanceError::configuration(format!(
                "cannot read CA descriptor {}: {}",
                descriptor_path.display(),
                e
            ))
        })?;
        let descriptor: LocalCaDescriptor = toml::from_str(&raw).map_err(|e| {
            IssuanceError::configuration(format!("malformed CA descriptor: {}", e))
        })?;
        let base = descriptor_path.parent().unwrap_or_else(|| Path::new("."));

        let key_pem = fs::read(base.join(&descriptor.key_path))
            .map_err(|e| IssuanceError::configuration(format!("cannot read CA key: {}", e)))?;
        let ca_key = PKey::private_key_from_pem(&key_pem)
            .map_err(|e| IssuanceError::configuration(format!("cannot parse CA key: {}", e)))?;
        let cert_pem = fs::read(base.join(&descriptor.cert_path)).map_err(|e| {
            IssuanceError::configuration(format!("cannot read CA certificate: {}", e))
        })?;
        let ca_cert = X509::from_pem(&cert_pem).map_err(|e| {
            IssuanceError::configuration(format!("cannot parse CA certificate: {}", e))
        })?;
        if !ca_cert
            .public_key()
            .map(|public| public.public_eq(&ca_key))
            .unwrap_or(false)
        {
            return Err(IssuanceError::configuration(
                "CA key does not match CA certificate",
            ));
        }

        let index = CaIndex::open(
            &base.join(&descriptor.serial_path),
            &base.join(&descriptor.index_path),
        )
        .map_err(|e| IssuanceError::configuration(format!("{:#}", e)))?;

        Ok(Self {
            state: Arc::new(Mutex::new(LocalCaState {
                ca_key,
                ca_cert,
                index,
                validity_days,
                unique_subject,
            })),
        })
    }

    /// Entries of the CA's `index.txt`
    pub fn records(&self) -> anyhow::Result<Vec<IndexRecord>> {
        self.state.lock().index.records()
    }
}

#[async_trait]
impl SigningBackend for LocalCaBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn sign(&mut self, request: &SigningRequest<'_>) -> Result<X509, IssuanceError> {
        let der = request
            .csr
            .to_der()
            .map_err(|e| IssuanceError::signing(format!("cannot encode CSR: {}", e)))?;
        let csr = X509Req::from_der(&der)
            .map_err(|e| IssuanceError::signing(format!("cannot decode CSR: {}", e)))?;
        let state = Arc::clone(&self.state);

        // The state lock keeps an abandoned (timed-out) signing exclusive too
        tokio::task::spawn_blocking(move || state.lock().sign(&csr))
            .await
            .map_err(|e| IssuanceError::signing(format!("signing worker failed: {}", e)))?
    }
}

impl LocalCaState {
    fn sign(&mut self, csr: &X509Req) -> Result<X509, IssuanceError> {
        let subject = oneline_subject(csr.subject_name());
        if self.unique_subject && self.index.has_valid_subject(&subject) {
            return Err(IssuanceError::signing(format!(
                "There is already a certificate for {}",
                subject
            )));
        }

        let expires = Utc::now() + Duration::days(i64::from(self.validity_days));
        let not_after = Asn1Time::from_unix(expires.timestamp())
            .map_err(|e| IssuanceError::signing(e.to_string()))?;
        let certificate = sign_user_request(
            csr,
            &self.ca_key,
            &self.ca_cert,
            self.index.next_serial(),
            &not_after,
        )
        .map_err(|e| IssuanceError::signing(format!("{:#}", e)))?;

        let serial = self
            .index
            .record_issued(&subject, expires)
            .map_err(|e| IssuanceError::signing(format!("{:#}", e)))?;
        if let Ok(hex) = serial.to_hex_str() {
            debug!(serial = %hex, subject = %subject, "Recorded issued certificate");
        }
        Ok(certificate)
    }
}

// ================= `openssl ca` subprocess backend =================

pub struct OpensslCliBackend {
    binary: PathBuf,
    config_path: PathBuf,
    validity_days: u32,
}

impl OpensslCliBackend {
    pub fn new(
        binary: PathBuf,
        config_path: PathBuf,
        validity_days: u32,
    ) -> Result<Self, IssuanceError> {
        if !config_path.is_file() {
            return Err(IssuanceError::configuration(format!(
                "OpenSSL CA configuration not found: {}",
                config_path.display()
            )));
        }
        Ok(Self {
            binary,
            config_path,
            validity_days,
        })
    }
}

#[async_trait]
impl SigningBackend for OpensslCliBackend {
    fn name(&self) -> &'static str {
        "openssl-cli"
    }

    async fn sign(&mut self, request: &SigningRequest<'_>) -> Result<X509, IssuanceError> {
        // kill_on_drop: a timed-out signing is cancelled by dropping this future
        let output = Command::new(&self.binary)
            .arg("ca")
            .arg("-batch")
            .arg("-notext")
            .arg("-config")
            .arg(&self.config_path)
            .arg("-days")
            .arg(self.validity_days.to_string())
            .arg("-in")
            .arg(request.csr_path)
            .arg("-out")
            .arg(request.cert_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                IssuanceError::signing(format!(
                    "failed to run {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).into_owned()
            } else {
                stderr.into_owned()
            };
            return Err(IssuanceError::signing(diagnostic));
        }

        let pem = fs::read(request.cert_path).map_err(|e| {
            IssuanceError::signing(format!("signed certificate missing: {}", e))
        })?;
        X509::from_pem(&pem)
            .map_err(|e| IssuanceError::signing(format!("unreadable signed certificate: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki_generator::bootstrap_dev_ca;
    use openssl::hash::MessageDigest;
    use openssl::x509::X509Name;

    fn csr_for(common_name: &str) -> X509Req {
        let key = PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, common_name)
            .unwrap();
        let mut req = X509Req::builder().unwrap();
        req.set_subject_name(&name.build()).unwrap();
        req.set_pubkey(&key).unwrap();
        req.sign(&key, MessageDigest::sha256()).unwrap();
        req.build()
    }

    async fn sign_with(backend: &mut LocalCaBackend, csr: &X509Req) -> Result<X509, IssuanceError> {
        let scratch = tempfile::tempdir().unwrap();
        let request = SigningRequest {
            csr,
            csr_path: &scratch.path().join("req.csr"),
            cert_path: &scratch.path().join("cert.pem"),
        };
        backend.sign(&request).await
    }

    #[tokio::test]
    async fn test_local_backend_assigns_sequential_serials() {
        let dir = tempfile::tempdir().unwrap();
        let paths = bootstrap_dev_ca(dir.path(), 2048).unwrap();
        let mut backend = LocalCaBackend::open(&paths.descriptor, 30, false).unwrap();

        let csr = csr_for("Maria Silva");
        let first = sign_with(&mut backend, &csr).await.unwrap();
        let second = sign_with(&mut backend, &csr).await.unwrap();

        let serial = |cert: &X509| {
            cert.serial_number()
                .to_bn()
                .unwrap()
                .to_hex_str()
                .unwrap()
                .to_string()
        };
        assert_eq!(serial(&first), "1000");
        assert_eq!(serial(&second), "1001");
        assert_eq!(backend.records().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unique_subject_policy_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let paths = bootstrap_dev_ca(dir.path(), 2048).unwrap();
        let mut backend = LocalCaBackend::open(&paths.descriptor, 30, true).unwrap();

        let csr = csr_for("Maria Silva");
        sign_with(&mut backend, &csr).await.unwrap();
        let err = sign_with(&mut backend, &csr).await.unwrap_err();
        match err {
            IssuanceError::Signing(message) => assert!(message.contains("already")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_signing_timeout_fires_while_local_ca_is_busy() {
        use crate::signing_unit::SigningUnit;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let paths = bootstrap_dev_ca(dir.path(), 2048).unwrap();
        let backend = LocalCaBackend::open(&paths.descriptor, 30, false).unwrap();
        let state = Arc::clone(&backend.state);
        let unit = SigningUnit::new(Box::new(backend), Duration::from_millis(100));
        let csr = csr_for("Maria Silva");
        let scratch = tempfile::tempdir().unwrap();
        let request = SigningRequest {
            csr: &csr,
            csr_path: &scratch.path().join("req.csr"),
            cert_path: &scratch.path().join("cert.pem"),
        };

        // Slow CA work: the only runtime thread must stay free for the timer
        let busy = state.lock();
        let err = unit.sign(&request).await.unwrap_err();
        assert!(matches!(err, IssuanceError::Signing(ref m) if m.contains("timed out")));
        drop(busy);

        let cert = unit.sign(&request).await.unwrap();
        let ca_cert = X509::from_pem(&fs::read(&paths.ca_cert).unwrap()).unwrap();
        assert!(cert.verify(&ca_cert.public_key().unwrap()).unwrap());
    }

    #[test]
    fn test_missing_descriptor_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalCaBackend::open(&dir.path().join("ca.toml"), 30, false)
            .err()
            .unwrap();
        assert!(matches!(err, IssuanceError::Configuration(_)));

        let err = OpensslCliBackend::new(
            PathBuf::from("openssl"),
            dir.path().join("openssl.cnf"),
            30,
        )
        .err()
        .unwrap();
        assert!(matches!(err, IssuanceError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_cli_backend_reports_process_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("openssl.cnf");
        fs::write(&config_path, "").unwrap();
        // `false` exits non-zero without output
        let mut backend =
            OpensslCliBackend::new(PathBuf::from("false"), config_path, 30).unwrap();

        let csr = csr_for("Maria Silva");
        let request = SigningRequest {
            csr: &csr,
            csr_path: &dir.path().join("req.csr"),
            cert_path: &dir.path().join("cert.pem"),
        };
        let err = backend.sign(&request).await.unwrap_err();
        assert!(matches!(err, IssuanceError::Signing(_)));
    }
}

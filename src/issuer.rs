//! Request orchestrator
//!
//! `issue` runs generator → signing unit → packager → artifact store, each
//! step inside a request-scoped [`WorkArea`]. Whatever the outcome, the work
//! area (and the private key in it) is gone when `issue` returns; only a
//! bundle that made it into the store survives.
//!
//! CPU-heavy steps (RSA key generation, PKCS#12 key derivation) run on the
//! blocking pool with a hard timeout so they do not stall other requests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::{error, info, warn};

use crate::ca_backend::SigningRequest;
use crate::configs::{AppConfig, SubjectDefaults, TimeoutConfig};
use crate::error::IssuanceError;
use crate::export_password::{ExportPassword, PasswordSource};
use crate::generate_user_keypair::{self, GeneratedRequest};
use crate::identity::{IdentityRequest, SubjectFields};
use crate::pfx_key::{self, TrustChain};
use crate::signing_unit::SigningUnit;
use crate::storage::{ArtifactStore, Clock, SystemClock};
use crate::work_area::WorkArea;

pub const PKCS12_MEDIA_TYPE: &str = "application/x-pkcs12";

/// Result of a successful issuance
#[derive(Debug)]
pub struct Issued {
    pub download_id: String,
    pub ttl_seconds: u64,
    /// Present when the password was generated for this bundle
    pub export_password: Option<ExportPassword>,
}

/// A consumed artifact, ready to hand to the caller
#[derive(Debug)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
    pub filename: String,
}

enum CaState {
    Ready {
        signer: SigningUnit,
        chain: TrustChain,
    },
    /// CA resources failed validation at startup
    Unavailable(String),
}

pub struct Issuer {
    ca: CaState,
    store: Arc<ArtifactStore>,
    passwords: PasswordSource,
    subject_defaults: SubjectDefaults,
    key_bits: u32,
    timeouts: TimeoutConfig,
    download_filename: String,
}

impl Issuer {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build the issuer. A broken CA setup is not fatal here: the issuer is
    /// still returned and every `issue` reports the configuration error.
    pub fn with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = ArtifactStore::open(&config.storage.directory, config.storage.ttl(), clock)
            .context("Failed to open artifact storage")?;
        let passwords =
            PasswordSource::from_config(&config.export).context("Invalid export settings")?;
        if matches!(passwords, PasswordSource::Fixed(_)) {
            warn!("Export bundles share one fixed password; prefer password_policy = \"per_request\"");
        }

        let ca = match Self::open_ca(config) {
            Ok((signer, chain)) => CaState::Ready { signer, chain },
            Err(e) => {
                error!(error = %e, "CA unavailable, issuance requests will be refused");
                CaState::Unavailable(e.to_string())
            }
        };

        Ok(Self {
            ca,
            store: Arc::new(store),
            passwords,
            subject_defaults: config.subject.clone(),
            key_bits: config.export.key_bits,
            timeouts: config.timeouts.clone(),
            download_filename: config.storage.download_filename.clone(),
        })
    }

    fn open_ca(config: &AppConfig) -> Result<(SigningUnit, TrustChain), IssuanceError> {
        let signer = SigningUnit::from_config(&config.ca, config.timeouts.signing())?;
        let chain = TrustChain::load(&config.ca.chain_path)?;
        Ok((signer, chain))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.ca, CaState::Ready { .. })
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub async fn issue(&self, identity: &IdentityRequest) -> Result<Issued, IssuanceError> {
        let (signer, chain) = match &self.ca {
            CaState::Ready { signer, chain } => (signer, chain),
            CaState::Unavailable(reason) => {
                return Err(IssuanceError::Configuration(reason.clone()))
            }
        };
        let subject = identity.subject()?;

        let work = WorkArea::create_in(&self.store.work_root()).map_err(|e| {
            IssuanceError::generation(format!("cannot create work area: {}", e))
        })?;

        let generated = self.generate(subject.clone(), &work).await?;

        let cert_path = work.cert_path();
        let certificate = signer
            .sign(&SigningRequest {
                csr: &generated.csr,
                csr_path: &generated.csr_path,
                cert_path: &cert_path,
            })
            .await?;

        let (password, disclose) = self.passwords.next()?;
        let bundle = self
            .package(
                generated.private_key,
                certificate.clone(),
                chain.clone(),
                password.clone(),
                subject.common_name.clone(),
                &work.bundle_path(),
            )
            .await?;

        let download_id = self.store.put(&bundle)?;
        drop(work);

        info!(
            serial = %serial_hex(&certificate),
            ttl_secs = self.store.ttl().as_secs(),
            "Issued client certificate"
        );
        Ok(Issued {
            download_id,
            ttl_seconds: self.store.ttl().as_secs(),
            export_password: disclose.then_some(password),
        })
    }

    pub fn retrieve(&self, download_id: &str) -> Result<Download, IssuanceError> {
        let bytes = self.store.take(download_id)?;
        info!(bytes = bytes.len(), "Artifact downloaded and removed");
        Ok(Download {
            bytes,
            media_type: PKCS12_MEDIA_TYPE,
            filename: self.download_filename.clone(),
        })
    }

    async fn generate(
        &self,
        subject: SubjectFields,
        work: &WorkArea,
    ) -> Result<GeneratedRequest, IssuanceError> {
        let defaults = self.subject_defaults.clone();
        let key_bits = self.key_bits;
        let key_path = work.key_path();
        let csr_path = work.csr_path();
        run_blocking(self.timeouts.generation(), IssuanceError::generation, move || {
            generate_user_keypair::generate(&subject, &defaults, key_bits, &key_path, &csr_path)
        })
        .await
    }

    async fn package(
        &self,
        private_key: PKey<Private>,
        certificate: X509,
        chain: TrustChain,
        password: ExportPassword,
        friendly_name: String,
        out: &Path,
    ) -> Result<std::path::PathBuf, IssuanceError> {
        let out = out.to_path_buf();
        run_blocking(self.timeouts.packaging(), IssuanceError::packaging, move || {
            pfx_key::package(&private_key, &certificate, &chain, &password, &friendly_name, &out)
        })
        .await
    }
}

/// Run `job` on the blocking pool; a timeout or a panic becomes `on_failure`
async fn run_blocking<T, F>(
    timeout: Duration,
    on_failure: fn(String) -> IssuanceError,
    job: F,
) -> Result<T, IssuanceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, IssuanceError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(job)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(on_failure(format!("worker failed: {}", join_error))),
        Err(_) => Err(on_failure(format!(
            "timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

fn serial_hex(certificate: &X509) -> String {
    certificate
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca_backend::LocalCaBackend;
    use crate::configs::{CaConfig, ExportConfig, PasswordPolicy, StorageConfig};
    use crate::pki_generator::bootstrap_dev_ca;
    use crate::storage::ManualClock;
    use openssl::nid::Nid;
    use std::collections::HashSet;
    use std::time::SystemTime;

    struct Harness {
        dir: tempfile::TempDir,
        config: AppConfig,
        clock: Arc<ManualClock>,
        issuer: Arc<Issuer>,
    }

    fn harness_with(adjust: impl FnOnce(&mut AppConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ca = bootstrap_dev_ca(&dir.path().join("ca"), 2048).unwrap();
        let mut config = AppConfig::new(
            CaConfig::local(&ca.descriptor, &ca.chain),
            StorageConfig::in_directory(dir.path().join("artifacts")),
        );
        adjust(&mut config);
        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let issuer = Arc::new(Issuer::with_clock(&config, clock.clone()).unwrap());
        Harness {
            dir,
            config,
            clock,
            issuer,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn maria() -> IdentityRequest {
        IdentityRequest {
            name: "Maria Silva".to_string(),
            email: "maria@example.com".to_string(),
            phone: "(62) 99999-0000".to_string(),
            national_id: "123.456.789-09".to_string(),
            address: "Rua 1, Setor Central, Goiania".to_string(),
        }
    }

    fn open_bundle(download: &Download, issued: &Issued) -> openssl::pkcs12::ParsedPkcs12_2 {
        let password = issued.export_password.as_ref().unwrap();
        pfx_key::load_pfx(&download.bytes, password.expose()).unwrap()
    }

    fn work_root_is_empty(h: &Harness) -> bool {
        std::fs::read_dir(h.config.storage.directory.join(".work"))
            .unwrap()
            .next()
            .is_none()
    }

    #[tokio::test]
    async fn test_issue_then_retrieve_maria() {
        let h = harness();
        let issued = h.issuer.issue(&maria()).await.unwrap();

        assert_eq!(issued.download_id.len(), 64);
        assert!(issued.download_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(issued.ttl_seconds, 600);

        let download = h.issuer.retrieve(&issued.download_id).unwrap();
        assert_eq!(download.media_type, "application/x-pkcs12");
        assert_eq!(download.filename, "certificado.pfx");

        let parsed = open_bundle(&download, &issued);
        let cert = parsed.cert.unwrap();
        let cn: Vec<String> = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .map(|e| String::from_utf8_lossy(e.data().as_slice()).into_owned())
            .collect();
        assert_eq!(cn, vec!["Maria Silva"]);
        assert!(work_root_is_empty(&h));
    }

    #[tokio::test]
    async fn test_bundle_round_trip_chains_to_trust_anchor() {
        let h = harness();
        let issued = h.issuer.issue(&maria()).await.unwrap();
        let download = h.issuer.retrieve(&issued.download_id).unwrap();
        let parsed = open_bundle(&download, &issued);

        let key = parsed.pkey.unwrap();
        let cert = parsed.cert.unwrap();
        assert!(cert.public_key().unwrap().public_eq(&key));

        let chain = X509::stack_from_pem(&std::fs::read(&h.config.ca.chain_path).unwrap()).unwrap();
        let bundled: Vec<Vec<u8>> = parsed
            .ca
            .unwrap()
            .iter()
            .map(|c| c.to_der().unwrap())
            .collect();
        for ca in &chain {
            assert!(bundled.contains(&ca.to_der().unwrap()));
        }
        // Leaf signed by the intermediate, intermediate by the root
        assert!(cert.verify(&chain[0].public_key().unwrap()).unwrap());
        assert!(chain[0].verify(&chain[1].public_key().unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_download_id_is_single_use() {
        let h = harness();
        let issued = h.issuer.issue(&maria()).await.unwrap();
        h.issuer.retrieve(&issued.download_id).unwrap();
        let err = h.issuer.retrieve(&issued.download_id).unwrap_err();
        assert!(matches!(err, IssuanceError::NotFound));
    }

    #[tokio::test]
    async fn test_download_expires_after_ttl() {
        let h = harness();
        let issued = h.issuer.issue(&maria()).await.unwrap();
        h.clock.advance(Duration::from_secs(601));
        let err = h.issuer.retrieve(&issued.download_id).unwrap_err();
        assert!(matches!(err, IssuanceError::NotFound));
    }

    #[tokio::test]
    async fn test_separator_name_is_normalized_not_fatal() {
        let h = harness();
        let identity = IdentityRequest::named("A/B\\C", "abc@example.com");
        let issued = h.issuer.issue(&identity).await.unwrap();
        let download = h.issuer.retrieve(&issued.download_id).unwrap();
        let cert = open_bundle(&download, &issued).cert.unwrap();
        let cn: Vec<String> = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .map(|e| String::from_utf8_lossy(e.data().as_slice()).into_owned())
            .collect();
        assert_eq!(cn, vec!["A-B-C"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_issuances_get_distinct_serials() {
        const N: usize = 24;
        let h = harness();

        let tasks: Vec<_> = (0..N)
            .map(|_| {
                let issuer = Arc::clone(&h.issuer);
                tokio::spawn(async move {
                    let issued = issuer.issue(&maria()).await.unwrap();
                    let download = issuer.retrieve(&issued.download_id).unwrap();
                    let cert = open_bundle(&download, &issued).cert.unwrap();
                    serial_hex(&cert)
                })
            })
            .collect();

        let mut serials = HashSet::new();
        for task in tasks {
            serials.insert(task.await.unwrap());
        }
        assert_eq!(serials.len(), N);

        // The CA index saw exactly N well-formed entries with the same serials
        let backend = LocalCaBackend::open(&h.config.ca.config_path, 30, false).unwrap();
        let records = backend.records().unwrap();
        assert_eq!(records.len(), N);
        let indexed: HashSet<String> = records.into_iter().map(|r| r.serial).collect();
        assert_eq!(indexed, serials);
        assert!(work_root_is_empty(&h));
    }

    #[tokio::test]
    async fn test_email_rules_at_issue() {
        let h = harness();
        let plus = IdentityRequest::named("Maria Silva", "maria+cert@example.com");
        let issued = h.issuer.issue(&plus).await.unwrap();
        let download = h.issuer.retrieve(&issued.download_id).unwrap();
        let cert = open_bundle(&download, &issued).cert.unwrap();
        let email: Vec<String> = cert
            .subject_name()
            .entries_by_nid(Nid::PKCS9_EMAILADDRESS)
            .map(|e| String::from_utf8_lossy(e.data().as_slice()).into_owned())
            .collect();
        assert_eq!(email, vec!["maria+cert@example.com"]);

        let accented = IdentityRequest::named("João", "joão@exemplo.com");
        let err = h.issuer.issue(&accented).await.unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidInput(_)));
        assert!(work_root_is_empty(&h));
    }

    #[tokio::test]
    async fn test_missing_ca_configuration_refuses_every_issue() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::new(
            CaConfig::local(dir.path().join("missing.toml"), dir.path().join("missing.pem")),
            StorageConfig::in_directory(dir.path().join("artifacts")),
        );
        let issuer = Issuer::from_config(&config).unwrap();
        assert!(!issuer.is_ready());

        for _ in 0..3 {
            let err = issuer.issue(&maria()).await.unwrap_err();
            assert!(matches!(err, IssuanceError::Configuration(_)));
        }
    }

    #[tokio::test]
    async fn test_signing_failure_leaves_nothing_behind() {
        let h = harness_with(|config| config.ca.unique_subject = true);
        h.issuer.issue(&maria()).await.unwrap();

        let err = h.issuer.issue(&maria()).await.unwrap_err();
        assert!(matches!(err, IssuanceError::Signing(_)));
        assert_eq!(h.issuer.store().len(), 1);
        assert!(work_root_is_empty(&h));
        let _ = &h.dir;
    }

    #[tokio::test]
    async fn test_fixed_password_is_not_disclosed() {
        let h = harness_with(|config| {
            config.export = ExportConfig {
                password_policy: PasswordPolicy::Fixed,
                fixed_password: Some("1234".to_string()),
                key_bits: 2048,
            }
        });
        let issued = h.issuer.issue(&maria()).await.unwrap();
        assert!(issued.export_password.is_none());

        let download = h.issuer.retrieve(&issued.download_id).unwrap();
        assert!(pfx_key::load_pfx(&download.bytes, "1234").is_ok());
    }

    #[tokio::test]
    async fn test_per_request_passwords_differ() {
        let h = harness();
        let a = h.issuer.issue(&maria()).await.unwrap();
        let b = h.issuer.issue(&maria()).await.unwrap();
        assert_ne!(
            a.export_password.unwrap().expose(),
            b.export_password.unwrap().expose()
        );
    }

    #[tokio::test]
    async fn test_blocking_step_timeout_maps_to_stage_error() {
        let err = run_blocking(Duration::from_millis(20), IssuanceError::generation, || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, IssuanceError::Generation(_)));
    }
}

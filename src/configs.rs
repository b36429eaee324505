use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub ca: CaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub subject: SubjectDefaults,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Origins allowed by CORS. A single `"*"` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8000
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CaBackendKind {
    /// In-process signing with the `openssl` crate against a local CA directory
    Local,
    /// `openssl ca` subprocess driven by an OpenSSL CA configuration file
    OpensslCli,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaConfig {
    #[serde(default = "default_ca_backend")]
    pub backend: CaBackendKind,
    /// CA configuration descriptor, passed through to the signing backend
    pub config_path: PathBuf,
    /// PEM trust chain embedded into every export bundle
    pub chain_path: PathBuf,
    #[serde(default = "default_openssl_binary")]
    pub openssl_binary: PathBuf,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    /// Reject a CSR whose subject matches a still-valid issued certificate
    #[serde(default)]
    pub unique_subject: bool,
}

impl CaConfig {
    pub fn local(config_path: impl Into<PathBuf>, chain_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: CaBackendKind::Local,
            config_path: config_path.into(),
            chain_path: chain_path.into(),
            openssl_binary: default_openssl_binary(),
            validity_days: default_validity_days(),
            unique_subject: false,
        }
    }
}

fn default_ca_backend() -> CaBackendKind {
    CaBackendKind::Local
}

fn default_openssl_binary() -> PathBuf {
    PathBuf::from("openssl")
}

fn default_validity_days() -> u32 {
    365
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_download_filename")]
    pub download_filename: String,
}

impl StorageConfig {
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_directory(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            download_filename: default_download_filename(),
        }
    }
}

fn default_storage_directory() -> PathBuf {
    PathBuf::from("data/artifacts")
}

fn default_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_download_filename() -> String {
    "certificado.pfx".to_string()
}

/// Fixed distinguished name fields of every issued certificate.
/// CN and emailAddress come from the identity request.
#[derive(Debug, Deserialize, Clone)]
pub struct SubjectDefaults {
    #[serde(default = "default_subject_country")]
    pub country: String,
    #[serde(default = "default_subject_state")]
    pub state: String,
    #[serde(default = "default_subject_locality")]
    pub locality: String,
    #[serde(default = "default_subject_org")]
    pub organization: String,
    #[serde(default = "default_subject_ou")]
    pub organizational_unit: String,
}

impl Default for SubjectDefaults {
    fn default() -> Self {
        Self {
            country: default_subject_country(),
            state: default_subject_state(),
            locality: default_subject_locality(),
            organization: default_subject_org(),
            organizational_unit: default_subject_ou(),
        }
    }
}

fn default_subject_country() -> String {
    "BR".to_string()
}

fn default_subject_state() -> String {
    "GO".to_string()
}

fn default_subject_locality() -> String {
    "Goiania".to_string()
}

fn default_subject_org() -> String {
    "Aurora-Teste".to_string()
}

fn default_subject_ou() -> String {
    "Dev".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PasswordPolicy {
    /// Fresh random password per bundle, returned with the issue response
    PerRequest,
    /// One shared password for every bundle
    Fixed,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_password_policy")]
    pub password_policy: PasswordPolicy,
    #[serde(default)]
    pub fixed_password: Option<String>,
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            password_policy: default_password_policy(),
            fixed_password: None,
            key_bits: default_key_bits(),
        }
    }
}

fn default_password_policy() -> PasswordPolicy {
    PasswordPolicy::PerRequest
}

fn default_key_bits() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_step_timeout")]
    pub generation_secs: u64,
    #[serde(default = "default_step_timeout")]
    pub signing_secs: u64,
    #[serde(default = "default_step_timeout")]
    pub packaging_secs: u64,
}

impl TimeoutConfig {
    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }

    pub fn signing(&self) -> Duration {
        Duration::from_secs(self.signing_secs)
    }

    pub fn packaging(&self) -> Duration {
        Duration::from_secs(self.packaging_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            generation_secs: default_step_timeout(),
            signing_secs: default_step_timeout(),
            packaging_secs: default_step_timeout(),
        }
    }
}

fn default_step_timeout() -> u64 {
    30
}

impl AppConfig {
    /// Configuration with every optional section at its default
    pub fn new(ca: CaConfig, storage: StorageConfig) -> Self {
        Self {
            server: ServerConfig::default(),
            ca,
            storage,
            subject: SubjectDefaults::default(),
            export: ExportConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}

//! pfx-issuer - short-lived client certificates as single-download PKCS#12 bundles
//!
//! Issues client identity certificates on behalf of an intermediate CA,
//! packages each one with its private key and trust chain, and serves the
//! bundle exactly once within a bounded time window.
//!
//! # Overview
//!
//! ```text
//! issue(identity)
//!   ├── generate_user_keypair   RSA key + CSR in a scoped work area
//!   ├── signing_unit            one signing at a time, CA serial/index state
//!   ├── pfx_key                 key + certificate + chain → PKCS#12
//!   └── storage                 download id → bundle, TTL, single use
//!
//! retrieve(download_id) → bundle bytes, entry and file removed
//! ```
//!
//! Root CA (self-signed, pathlen=1) → intermediate CA (pathlen=0) → client
//! certificate (CA=false, clientAuth). The development hierarchy comes from
//! [`pki_generator::bootstrap_dev_ca`]; production deployments point
//! `[ca] config_path` at an existing CA.
//!
//! # Quick Start
//!
//! ```bash
//! # Development CA for the `local` backend
//! pfx-issuer bootstrap-ca --dir ca
//!
//! # config.toml:
//! #   [ca]
//! #   config_path = "ca/ca.toml"
//! #   chain_path = "ca/chain.pem"
//! pfx-issuer serve --config config.toml
//! ```
//!
//! # Library use
//!
//! ```no_run
//! use pfx_issuer::configs::AppConfig;
//! use pfx_issuer::identity::IdentityRequest;
//! use pfx_issuer::issuer::Issuer;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! let issuer = Issuer::from_config(&config)?;
//! let issued = issuer
//!     .issue(&IdentityRequest::named("Maria Silva", "maria@example.com"))
//!     .await?;
//! let bundle = issuer.retrieve(&issued.download_id)?;
//! std::fs::write(&bundle.filename, &bundle.bytes)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Client private keys only exist inside a request-scoped work area and are
//!   zero-filled before the directory is removed
//! - Export passwords are generated per request and never logged
//! - A bundle is removed from disk on its first download or at expiry

pub mod ca_backend;
pub mod ca_index;
pub mod configs;
pub mod error;
pub mod export_password;
pub mod generate_user_keypair;
pub mod identity;
pub mod issuer;
pub mod pfx_key;
pub mod pki_generator;
pub mod protocol;
pub mod signing_unit;
pub mod storage;
pub mod webserver;
pub mod work_area;

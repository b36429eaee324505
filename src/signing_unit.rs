//! CA Signing Unit
//!
//! The one place CSRs are turned into certificates. The backend, and with it
//! the CA serial/index state, sits behind a single process-wide
//! `tokio::sync::Mutex`. That mutex is fair, so concurrent requests are served
//! in arrival order. It is held only for the duration of one signing call.
//! Key generation and packaging happen outside it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use openssl::x509::X509;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ca_backend::{self, SigningBackend, SigningRequest};
use crate::configs::CaConfig;
use crate::error::IssuanceError;

#[derive(Clone)]
pub struct SigningUnit {
    backend: Arc<Mutex<Box<dyn SigningBackend>>>,
    timeout: Duration,
}

impl SigningUnit {
    pub fn new(backend: Box<dyn SigningBackend>, timeout: Duration) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            timeout,
        }
    }

    /// Validate CA resources and open the configured backend
    pub fn from_config(config: &CaConfig, timeout: Duration) -> Result<Self, IssuanceError> {
        if !config.config_path.is_file() {
            return Err(IssuanceError::configuration(format!(
                "CA configuration descriptor not found: {}",
                config.config_path.display()
            )));
        }
        if !config.chain_path.is_file() {
            return Err(IssuanceError::configuration(format!(
                "CA trust chain not found: {}",
                config.chain_path.display()
            )));
        }
        Ok(Self::new(ca_backend::from_config(config)?, timeout))
    }

    pub async fn sign(&self, request: &SigningRequest<'_>) -> Result<X509, IssuanceError> {
        let queued = Instant::now();
        let mut backend = self.backend.lock().await;
        let waited = queued.elapsed();

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, backend.sign(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(backend = backend.name(), timeout = ?self.timeout, "Signing timed out");
                Err(IssuanceError::signing(format!(
                    "signing backend timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };
        debug!(
            backend = backend.name(),
            waited_ms = waited.as_millis() as u64,
            signed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Signing call finished"
        );
        result
    }
}

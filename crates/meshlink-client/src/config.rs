//! Client configuration

use crate::backoff::BackoffConfig;
use crate::store::StateStorage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Coordination server used when none is configured
pub const DEFAULT_CONTROL_URL: &str = "https://controlplane.meshlink.dev";

/// Start-up configuration
#[derive(Clone)]
pub struct MeshConfig {
    /// Persistence for the credential and ownership token.
    /// Without it every start ends in `NeedsLogin`.
    pub state_storage: Option<Arc<dyn StateStorage>>,
    /// Pre-authorized key; skips interactive login
    pub auth_key: Option<String>,
    pub control_url: String,
    pub hostname: String,
    pub backoff: BackoffConfig,
    /// How often the ownership token is re-checked
    pub ownership_check_interval: Duration,
}

impl fmt::Debug for MeshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshConfig")
            .field("state_storage", &self.state_storage.is_some())
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("control_url", &self.control_url)
            .field("hostname", &self.hostname)
            .field("backoff", &self.backoff)
            .field("ownership_check_interval", &self.ownership_check_interval)
            .finish()
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            state_storage: None,
            auth_key: None,
            control_url: DEFAULT_CONTROL_URL.to_string(),
            hostname: generate_hostname(),
            backoff: BackoffConfig::default(),
            ownership_check_interval: Duration::from_secs(2),
        }
    }
}

impl MeshConfig {
    pub fn builder() -> MeshConfigBuilder {
        MeshConfigBuilder::default()
    }
}

/// `mesh-` followed by eight random hex digits
fn generate_hostname() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("mesh-{}", &id[..8])
}

/// Builder for MeshConfig
#[derive(Default)]
pub struct MeshConfigBuilder {
    config: MeshConfig,
}

impl MeshConfigBuilder {
    pub fn state_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.config.state_storage = Some(storage);
        self
    }

    /// An empty key is treated as no key
    pub fn auth_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.config.auth_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn control_url(mut self, url: impl Into<String>) -> Self {
        self.config.control_url = url.into();
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn ownership_check_interval(mut self, interval: Duration) -> Self {
        self.config.ownership_check_interval = interval;
        self
    }

    pub fn build(self) -> Result<MeshConfig, String> {
        let url = &self.config.control_url;
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(format!("control_url must be an http(s) URL: {}", url));
        }
        if self.config.hostname.trim().is_empty() {
            return Err("hostname cannot be empty".to_string());
        }
        let multiplier = self.config.backoff.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err("backoff multiplier must be a finite value of at least 1".to_string());
        }
        if self.config.ownership_check_interval.is_zero() {
            return Err("ownership_check_interval must be non-zero".to_string());
        }
        Ok(self.config)
    }
}

use std::sync::Arc;
use std::time::Duration;

use harbor_signing::{Verifier, DEFAULT_MAX_SKEW_SECS};
use serde::Deserialize;
use tracing::warn;

use crate::provision::{
    DigitalOceanConfig, DigitalOceanProvisioner, Provisioner, UnconfiguredProvisioner,
};

const DEFAULT_CORS_ORIGINS: [&str; 3] = [
    "https://test.femquest.gamelabgraz",
    "https://test.femquest.gamelabgraz.at",
    "https://femquest.gamelabgraz.at",
];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub digitalocean_token: Option<String>,
    #[serde(default = "default_api_base")]
    pub digitalocean_api_base: String,
    #[serde(default = "default_droplet_tag")]
    pub droplet_tag: String,
    #[serde(default = "default_region")]
    pub droplet_region: String,
    #[serde(default = "default_size")]
    pub droplet_size: String,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub internal_hmac_key: Option<String>,
    #[serde(default)]
    pub internal_hmac_secret: Option<String>,
    #[serde(default = "default_max_skew")]
    pub internal_hmac_max_skew_seconds: u64,
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
    #[serde(default = "default_poll_attempts")]
    pub droplet_ip_poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub droplet_ip_poll_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            digitalocean_token: None,
            digitalocean_api_base: default_api_base(),
            droplet_tag: default_droplet_tag(),
            droplet_region: default_region(),
            droplet_size: default_size(),
            snapshot_id: None,
            internal_hmac_key: None,
            internal_hmac_secret: None,
            internal_hmac_max_skew_seconds: default_max_skew(),
            cors_allowed_origins: None,
            droplet_ip_poll_attempts: default_poll_attempts(),
            droplet_ip_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.digitalocean_token = Self::normalize_opt(self.digitalocean_token.take());
        self.snapshot_id = Self::normalize_opt(self.snapshot_id.take());
        self.internal_hmac_key = Self::normalize_opt(self.internal_hmac_key.take());
        self.internal_hmac_secret = Self::normalize_opt(self.internal_hmac_secret.take());
        self.cors_allowed_origins = Self::normalize_opt(self.cors_allowed_origins.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// `INTERNAL_HMAC_KEY`, falling back to `INTERNAL_HMAC_SECRET`.
    pub fn hmac_secret(&self) -> Option<&str> {
        self.internal_hmac_key
            .as_deref()
            .or(self.internal_hmac_secret.as_deref())
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::new(
            self.hmac_secret().map(|s| s.as_bytes().to_vec()),
            self.internal_hmac_max_skew_seconds,
        )
    }

    pub fn cors_origins(&self) -> Vec<String> {
        match &self.cors_allowed_origins {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn digitalocean(&self) -> Option<DigitalOceanConfig> {
        let token = self.digitalocean_token.clone()?;
        Some(DigitalOceanConfig {
            api_base: self.digitalocean_api_base.clone(),
            token,
            tag: self.droplet_tag.clone(),
            region: self.droplet_region.clone(),
            size: self.droplet_size.clone(),
            image: self.snapshot_id.clone(),
            address_poll_attempts: self.droplet_ip_poll_attempts,
            address_poll_interval: Duration::from_millis(self.droplet_ip_poll_interval_ms),
        })
    }

    /// Falls back to [`UnconfiguredProvisioner`] when credentials are missing
    /// or rejected, so the broker can still serve reuse and callbacks.
    pub fn provisioner(&self) -> Arc<dyn Provisioner> {
        let Some(config) = self.digitalocean() else {
            warn!("DIGITALOCEAN_TOKEN not set; provisioning and droplet teardown are disabled");
            return Arc::new(UnconfiguredProvisioner);
        };
        match DigitalOceanProvisioner::new(config) {
            Ok(provisioner) => Arc::new(provisioner),
            Err(err) => {
                warn!(error = %err, "digitalocean provisioner unavailable");
                Arc::new(UnconfiguredProvisioner)
            }
        }
    }

    pub fn provisioning_enabled(&self) -> bool {
        self.digitalocean_token.is_some()
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_db_path() -> String {
    "harbor.db".to_string()
}

fn default_api_base() -> String {
    "https://api.digitalocean.com/v2".to_string()
}

fn default_droplet_tag() -> String {
    "femquest-server".to_string()
}

fn default_region() -> String {
    "nyc3".to_string()
}

fn default_size() -> String {
    "s-1vcpu-1gb".to_string()
}

fn default_max_skew() -> u64 {
    DEFAULT_MAX_SKEW_SECS
}

fn default_poll_attempts() -> u32 {
    30
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

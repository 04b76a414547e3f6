//! Cloud provider seam. The orchestrator only ever talks to [`Provisioner`].

mod digitalocean;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::{Droplet, DropletId};

pub use digitalocean::{DigitalOceanConfig, DigitalOceanProvisioner};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioner not configured: {0}")]
    NotConfigured(&'static str),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("provider response missing {0}")]
    MissingField(&'static str),
    #[error("droplet {0} never reported a public address")]
    AddressTimeout(DropletId),
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates a droplet and returns once it has a routable address.
    async fn create(&self) -> Result<Droplet, ProvisionError>;

    /// Destroys a droplet. A droplet the provider no longer knows is an error.
    async fn destroy(&self, id: DropletId) -> Result<(), ProvisionError>;

    /// Every droplet carrying the broker's tag that already has an address.
    async fn list_tagged(&self) -> Result<Vec<Droplet>, ProvisionError>;
}

/// Stand-in used when no provider credentials are configured. Reuse, join and
/// heartbeats keep working; anything that needs the provider fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProvisioner;

#[async_trait]
impl Provisioner for UnconfiguredProvisioner {
    async fn create(&self) -> Result<Droplet, ProvisionError> {
        Err(ProvisionError::NotConfigured("DIGITALOCEAN_TOKEN is not set"))
    }

    async fn destroy(&self, _id: DropletId) -> Result<(), ProvisionError> {
        Err(ProvisionError::NotConfigured("DIGITALOCEAN_TOKEN is not set"))
    }

    async fn list_tagged(&self) -> Result<Vec<Droplet>, ProvisionError> {
        Err(ProvisionError::NotConfigured("DIGITALOCEAN_TOKEN is not set"))
    }
}

//! Session lifecycle: reuse or provision on start, resolve share tags on join,
//! reclaim on end, and track client counts through heartbeats.
//!
//! The registry is only written after the provider call it depends on has
//! returned, and no registry transaction is held open across a provider call.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::provision::{ProvisionError, Provisioner};
use crate::registry::{Droplet, DropletId, Registry, RegistryError, SessionRecord};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session registered for {0}")]
    NotFound(String),
    #[error("droplet {address} was provisioned but has no share tag")]
    ShareTagMissing { address: String },
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("registry failure: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// An idle droplet was handed out; nothing was provisioned.
    Reused { address: String, share_tag: String },
    Provisioned {
        address: String,
        share_tag: String,
        droplet_id: DropletId,
    },
}

impl StartOutcome {
    pub fn address(&self) -> &str {
        match self {
            StartOutcome::Reused { address, .. } | StartOutcome::Provisioned { address, .. } => {
                address
            }
        }
    }

    pub fn share_tag(&self) -> &str {
        match self {
            StartOutcome::Reused { share_tag, .. }
            | StartOutcome::Provisioned { share_tag, .. } => share_tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    InstanceDestroyed(DropletId),
    /// The record had no backing droplet, so only the row was removed.
    LocalRecordRemoved,
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    registry: Registry,
    provisioner: Arc<dyn Provisioner>,
}

impl SessionOrchestrator {
    pub fn new(registry: Registry, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            registry,
            provisioner,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn start_session(&self) -> Result<StartOutcome, SessionError> {
        if let Some(free) = self.registry.find_free_session().await? {
            info!(address = %free.address, "reusing idle droplet");
            return Ok(StartOutcome::Reused {
                address: free.address,
                share_tag: free.share_tag,
            });
        }

        let droplet = self.provisioner.create().await?;
        info!(address = %droplet.address, droplet_id = %droplet.id, "provisioned droplet");

        match self.record_provisioned(&droplet.address, droplet.id).await {
            Ok(share_tag) => Ok(StartOutcome::Provisioned {
                address: droplet.address,
                share_tag,
                droplet_id: droplet.id,
            }),
            Err(err) => {
                error!(
                    address = %droplet.address,
                    droplet_id = %droplet.id,
                    error = %err,
                    "provisioned droplet could not be registered; releasing it"
                );
                self.release_unregistered(&droplet.address, droplet.id).await;
                Err(err)
            }
        }
    }

    async fn record_provisioned(
        &self,
        address: &str,
        id: DropletId,
    ) -> Result<String, SessionError> {
        self.registry
            .reconcile(&[Droplet::new(address, id)])
            .await?;
        self.registry
            .share_tag_for(address)
            .await?
            .ok_or_else(|| SessionError::ShareTagMissing {
                address: address.to_string(),
            })
    }

    async fn release_unregistered(&self, address: &str, id: DropletId) {
        // A heartbeat may already own the row; leave it alone unless it is ours.
        if let Err(err) = self.registry.delete_if_droplet(address, id).await {
            warn!(%address, error = %err, "failed to drop partial registry record");
        }
        if let Err(err) = self.provisioner.destroy(id).await {
            warn!(droplet_id = %id, error = %err, "failed to destroy unregistered droplet");
        }
    }

    pub async fn join_session(&self, share_tag: &str) -> Result<String, SessionError> {
        self.registry
            .address_for_share_tag(share_tag)
            .await?
            .ok_or_else(|| SessionError::NotFound(share_tag.to_string()))
    }

    /// Removes the record and, when it was backed by a droplet, destroys it.
    /// The row is gone even if the provider call fails afterwards.
    pub async fn end_session(&self, address: &str) -> Result<EndOutcome, SessionError> {
        let droplet_id = self.registry.droplet_id_for(address).await?;
        if !self.registry.delete_by_address(address).await? {
            return Err(SessionError::NotFound(address.to_string()));
        }

        match droplet_id {
            Some(id) => {
                self.provisioner.destroy(id).await?;
                info!(%address, droplet_id = %id, "session ended; droplet destroyed");
                Ok(EndOutcome::InstanceDestroyed(id))
            }
            None => {
                info!(%address, "session ended; local record removed");
                Ok(EndOutcome::LocalRecordRemoved)
            }
        }
    }

    pub async fn heartbeat(
        &self,
        address: &str,
        connected_clients: u32,
    ) -> Result<SessionRecord, SessionError> {
        self.registry
            .upsert_heartbeat(address, connected_clients)
            .await?;
        // A teardown can land between the write and this read.
        self.registry
            .get(address)
            .await?
            .ok_or_else(|| SessionError::NotFound(address.to_string()))
    }

    /// Pulls every tagged droplet from the provider into the registry.
    pub async fn sync_with_provider(&self) -> Result<usize, SessionError> {
        let droplets = self.provisioner.list_tagged().await?;
        self.registry.reconcile(&droplets).await?;
        info!(count = droplets.len(), "registry reconciled with provider");
        Ok(droplets.len())
    }
}

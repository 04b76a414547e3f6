#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beach_harbor::provision::{ProvisionError, Provisioner};
use beach_harbor::registry::{Droplet, DropletId};

/// Provider double that hands out scripted droplets and records every call.
#[derive(Default)]
pub struct RecordingProvisioner {
    to_create: Mutex<VecDeque<Droplet>>,
    listing: Mutex<Vec<Droplet>>,
    creates: AtomicUsize,
    destroyed: Mutex<Vec<DropletId>>,
    fail_destroy: bool,
}

impl RecordingProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn creating(droplets: &[(&str, i64)]) -> Arc<Self> {
        let provisioner = Self::default();
        {
            let mut queue = provisioner.to_create.lock().unwrap();
            for (address, id) in droplets {
                queue.push_back(droplet(address, *id));
            }
        }
        Arc::new(provisioner)
    }

    pub fn failing_destroy() -> Arc<Self> {
        Arc::new(Self {
            fail_destroy: true,
            ..Self::default()
        })
    }

    pub fn set_listing(&self, droplets: Vec<Droplet>) {
        *self.listing.lock().unwrap() = droplets;
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<DropletId> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn create(&self) -> Result<Droplet, ProvisionError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.to_create
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProvisionError::UnexpectedStatus {
                status: reqwest::StatusCode::UNPROCESSABLE_ENTITY,
                body: "droplet limit reached for token dop_v1_secret".to_string(),
            })
    }

    async fn destroy(&self, id: DropletId) -> Result<(), ProvisionError> {
        self.destroyed.lock().unwrap().push(id);
        if self.fail_destroy {
            return Err(ProvisionError::UnexpectedStatus {
                status: reqwest::StatusCode::NOT_FOUND,
                body: "not found".to_string(),
            });
        }
        Ok(())
    }

    async fn list_tagged(&self) -> Result<Vec<Droplet>, ProvisionError> {
        Ok(self.listing.lock().unwrap().clone())
    }
}

pub fn droplet(address: &str, id: i64) -> Droplet {
    Droplet::new(address, DropletId::new(id).expect("positive droplet id"))
}

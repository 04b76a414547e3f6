use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{ProvisionError, Provisioner};
use crate::registry::{Droplet, DropletId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DigitalOceanConfig {
    pub api_base: String,
    pub token: String,
    pub tag: String,
    pub region: String,
    pub size: String,
    /// Snapshot id or image slug the game server boots from.
    pub image: Option<String>,
    pub address_poll_attempts: u32,
    pub address_poll_interval: Duration,
}

#[derive(Clone)]
pub struct DigitalOceanProvisioner {
    http: Client,
    config: DigitalOceanConfig,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Option<DropletBody>,
}

#[derive(Debug, Deserialize)]
struct DropletList {
    #[serde(default)]
    droplets: Vec<DropletBody>,
}

#[derive(Debug, Deserialize)]
struct DropletBody {
    id: Option<i64>,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<V4Network>,
}

#[derive(Debug, Deserialize)]
struct V4Network {
    ip_address: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl DropletBody {
    fn droplet_id(&self) -> Option<DropletId> {
        self.id.and_then(DropletId::new)
    }

    /// The public IPv4 address, or the first one listed when none is marked public.
    fn address(&self) -> Option<&str> {
        let v4 = &self.networks.v4;
        v4.iter()
            .find(|net| net.kind.as_deref() == Some("public"))
            .or_else(|| v4.first())
            .map(|net| net.ip_address.as_str())
            .filter(|ip| !ip.is_empty())
    }
}

impl DigitalOceanProvisioner {
    pub fn new(config: DigitalOceanConfig) -> Result<Self, ProvisionError> {
        if config.token.trim().is_empty() {
            return Err(ProvisionError::NotConfigured("DIGITALOCEAN_TOKEN is not set"));
        }
        if config.tag.trim().is_empty() {
            return Err(ProvisionError::NotConfigured("DROPLET_TAG is not set"));
        }
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, config })
    }

    fn droplets_url(&self) -> String {
        format!("{}/droplets", self.config.api_base.trim_end_matches('/'))
    }

    fn droplet_url(&self, id: DropletId) -> String {
        format!("{}/{}", self.droplets_url(), id)
    }

    fn create_payload(&self) -> Value {
        // Snapshot ids are numeric, public images are slugs.
        let image = self.config.image.as_deref().map(|image| {
            image
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(image))
        });
        json!({
            "name": format!("game-session-{}", self.config.tag),
            "region": self.config.region,
            "size": self.config.size,
            "image": image,
            "tags": [self.config.tag],
        })
    }

    async fn fetch_droplet(&self, id: DropletId) -> Result<DropletBody, ProvisionError> {
        let res = self
            .http
            .get(self.droplet_url(id))
            .bearer_auth(&self.config.token)
            .send()
            .await?;
        let envelope: DropletEnvelope = expect_status(res, StatusCode::OK).await?.json().await?;
        envelope.droplet.ok_or(ProvisionError::MissingField("droplet"))
    }

    async fn wait_for_address(&self, id: DropletId) -> Result<String, ProvisionError> {
        let attempts = self.config.address_poll_attempts.max(1);
        for attempt in 1..=attempts {
            let droplet = self.fetch_droplet(id).await?;
            if let Some(address) = droplet.address() {
                return Ok(address.to_string());
            }
            debug!(droplet_id = %id, attempt, "droplet has no address yet");
            if attempt < attempts {
                tokio::time::sleep(self.config.address_poll_interval).await;
            }
        }
        Err(ProvisionError::AddressTimeout(id))
    }
}

#[async_trait]
impl Provisioner for DigitalOceanProvisioner {
    async fn create(&self) -> Result<Droplet, ProvisionError> {
        let res = self
            .http
            .post(self.droplets_url())
            .bearer_auth(&self.config.token)
            .json(&self.create_payload())
            .send()
            .await?;
        let envelope: DropletEnvelope =
            expect_status(res, StatusCode::ACCEPTED).await?.json().await?;
        let created = envelope
            .droplet
            .ok_or(ProvisionError::MissingField("droplet"))?;
        let id = created
            .droplet_id()
            .ok_or(ProvisionError::MissingField("droplet id"))?;

        let address = match created.address() {
            Some(address) => address.to_string(),
            None => match self.wait_for_address(id).await {
                Ok(address) => address,
                Err(err) => {
                    // Never leave a droplet running that nobody can reach.
                    if let Err(cleanup) = self.destroy(id).await {
                        warn!(droplet_id = %id, error = %cleanup, "failed to remove unreachable droplet");
                    }
                    return Err(err);
                }
            },
        };

        info!(droplet_id = %id, %address, "droplet created");
        Ok(Droplet::new(address, id))
    }

    async fn destroy(&self, id: DropletId) -> Result<(), ProvisionError> {
        let res = self
            .http
            .delete(self.droplet_url(id))
            .bearer_auth(&self.config.token)
            .send()
            .await?;
        expect_status(res, StatusCode::NO_CONTENT).await?;
        info!(droplet_id = %id, "droplet destroyed");
        Ok(())
    }

    async fn list_tagged(&self) -> Result<Vec<Droplet>, ProvisionError> {
        let res = self
            .http
            .get(self.droplets_url())
            .bearer_auth(&self.config.token)
            .query(&[("tag_name", self.config.tag.as_str()), ("per_page", "200")])
            .send()
            .await?;
        let list: DropletList = expect_status(res, StatusCode::OK).await?.json().await?;

        let droplets = list
            .droplets
            .iter()
            .filter_map(|body| match (body.address(), body.droplet_id()) {
                (Some(address), Some(id)) => Some(Droplet::new(address, id)),
                _ => {
                    debug!(droplet_id = ?body.id, "skipping tagged droplet without id or address");
                    None
                }
            })
            .collect();
        Ok(droplets)
    }
}

async fn expect_status(res: Response, expected: StatusCode) -> Result<Response, ProvisionError> {
    if res.status() == expected {
        Ok(res)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(ProvisionError::UnexpectedStatus { status, body })
    }
}

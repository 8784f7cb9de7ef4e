//! Service descriptor: payment groups, pricing and endpoints, plus the
//! registry and content store it is fetched through.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PaymentError;
use crate::units::{Address, Cogs, GroupId};

pub const FIXED_PRICE_MODEL: &str = "fixed_price";
pub const DEFAULT_METADATA_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("service {org_id}/{service_id} is not registered")]
    UnknownService { org_id: String, service_id: String },
    #[error("unsupported metadata uri `{0}`")]
    UnsupportedUri(String),
    #[error("metadata fetch failed: {0}")]
    Fetch(String),
    #[error("metadata store returned {status} for {uri}")]
    Status { status: u16, uri: String },
    #[error("metadata parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

impl From<MetadataError> for PaymentError {
    fn from(error: MetadataError) -> Self {
        Self::InvalidServiceMetadata(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub price_model: String,
    #[serde(default)]
    pub price_in_cogs: Option<Cogs>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPayment {
    pub payment_address: Address,
    pub payment_expiration_threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub group_name: String,
    pub group_id: GroupId,
    #[serde(default)]
    pub pricing: Vec<Pricing>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub payment: GroupPayment,
}

impl ServiceGroup {
    /// Default fixed-price entry, or the first fixed-price entry.
    pub fn fixed_price(&self) -> Result<Cogs, MetadataError> {
        let fixed = |pricing: &&Pricing| pricing.price_model == FIXED_PRICE_MODEL;
        self.pricing
            .iter()
            .filter(fixed)
            .find(|pricing| pricing.default)
            .or_else(|| self.pricing.iter().find(fixed))
            .and_then(|pricing| pricing.price_in_cogs)
            .ok_or_else(|| {
                MetadataError::Invalid(format!(
                    "group `{}` has no fixed price",
                    self.group_name
                ))
            })
    }

    pub fn first_endpoint(&self) -> Result<&str, MetadataError> {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.trim())
            .find(|endpoint| !endpoint.is_empty())
            .ok_or_else(|| {
                MetadataError::Invalid(format!("group `{}` has no endpoints", self.group_name))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub mpe_address: Option<Address>,
    pub groups: Vec<ServiceGroup>,
}

impl ServiceMetadata {
    pub fn from_json(bytes: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(bytes).map_err(|error| MetadataError::Parse(error.to_string()))
    }

    /// Named group, or the first group when `name` is `None`.
    pub fn group(&self, name: Option<&str>) -> Result<&ServiceGroup, MetadataError> {
        match name {
            Some(name) => self
                .groups
                .iter()
                .find(|group| group.group_name == name)
                .ok_or_else(|| MetadataError::Invalid(format!("group `{name}` not found"))),
            None => self
                .groups
                .first()
                .ok_or_else(|| MetadataError::Invalid("service has no groups".to_string())),
        }
    }
}

/// Resolves a registered service to the URI of its metadata.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn service_metadata_uri(
        &self,
        org_id: &str,
        service_id: &str,
    ) -> Result<String, MetadataError>;
}

/// Content store holding service metadata documents.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, MetadataError>;
}

/// Fixed `org/service -> uri` table, usually from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entries: HashMap<String, String>,
}

impl StaticRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_service(
        mut self,
        org_id: &str,
        service_id: &str,
        metadata_uri: impl Into<String>,
    ) -> Self {
        self.entries
            .insert(service_key(org_id, service_id), metadata_uri.into());
        self
    }

    #[must_use]
    pub fn from_entries(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

fn service_key(org_id: &str, service_id: &str) -> String {
    format!("{org_id}/{service_id}")
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn service_metadata_uri(
        &self,
        org_id: &str,
        service_id: &str,
    ) -> Result<String, MetadataError> {
        self.entries
            .get(&service_key(org_id, service_id))
            .cloned()
            .ok_or_else(|| MetadataError::UnknownService {
                org_id: org_id.to_string(),
                service_id: service_id.to_string(),
            })
    }
}

/// Fetches `ipfs://` documents through an IPFS HTTP API gateway. Plain
/// `http(s)://` URIs are fetched directly and `file://` paths read locally.
#[derive(Debug, Clone)]
pub struct HttpMetadataStore {
    gateway_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpMetadataStore {
    #[must_use]
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into().trim().trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(DEFAULT_METADATA_TIMEOUT_MS),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms.max(100));
        self
    }

    #[must_use]
    pub fn ipfs_cat_url(&self, hash: &str) -> String {
        format!("{}/api/v0/cat?arg={hash}", self.gateway_url)
    }

    async fn read(
        &self,
        request: reqwest::RequestBuilder,
        uri: &str,
    ) -> Result<Vec<u8>, MetadataError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| MetadataError::Fetch(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                status: status.as_u16(),
                uri: uri.to_string(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|error| MetadataError::Fetch(error.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, MetadataError> {
        let uri = uri.trim();
        if let Some(hash) = uri.strip_prefix("ipfs://") {
            let hash = hash.trim_matches('/');
            if hash.is_empty() {
                return Err(MetadataError::UnsupportedUri(uri.to_string()));
            }
            tracing::debug!(hash, "fetching service metadata from ipfs");
            return self.read(self.http.post(self.ipfs_cat_url(hash)), uri).await;
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return tokio::fs::read(path)
                .await
                .map_err(|error| MetadataError::Fetch(format!("{path}: {error}")));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return self.read(self.http.get(uri), uri).await;
        }
        Err(MetadataError::UnsupportedUri(uri.to_string()))
    }
}

/// Looks up and parses the metadata of `org_id/service_id`.
pub async fn load_service_metadata(
    registry: &dyn Registry,
    store: &dyn MetadataStore,
    org_id: &str,
    service_id: &str,
) -> Result<ServiceMetadata, MetadataError> {
    let uri = registry.service_metadata_uri(org_id, service_id).await?;
    let bytes = store.fetch(&uri).await?;
    ServiceMetadata::from_json(&bytes)
}

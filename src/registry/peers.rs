//! Providers of the default peer organization list.
//!
//! The list is external input: providers hand back raw JSON and the
//! registry checks its shape before trusting any entry.

use crate::core::{RegistryError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// A peer organization imported automatically at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultOrganization {
    pub org_uid: String,
    pub ip: String,
    #[serde(deserialize_with = "port_from_number_or_text")]
    pub port: u16,
}

impl DefaultOrganization {
    pub fn from_json(entry: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(entry.clone())?)
    }
}

fn port_from_number_or_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[async_trait]
pub trait DefaultOrganizationSource: Send + Sync {
    /// The raw list; expected to be an array of `{orgUid, ip, port}`.
    async fn default_organizations(&self) -> Result<serde_json::Value>;
}

/// A fixed list, e.g. compiled into the deployment.
pub struct StaticDefaultOrganizations {
    list: serde_json::Value,
}

impl StaticDefaultOrganizations {
    pub fn new(list: serde_json::Value) -> Self {
        Self { list }
    }
}

#[async_trait]
impl DefaultOrganizationSource for StaticDefaultOrganizations {
    async fn default_organizations(&self) -> Result<serde_json::Value> {
        Ok(self.list.clone())
    }
}

/// A list published as JSON at a URL.
pub struct HttpDefaultOrganizations {
    client: reqwest::Client,
    url: String,
}

impl HttpDefaultOrganizations {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(RegistryError::Configuration(
                "default organization list URL is empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl DefaultOrganizationSource for HttpDefaultOrganizations {
    async fn default_organizations(&self) -> Result<serde_json::Value> {
        let list = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list)
    }
}

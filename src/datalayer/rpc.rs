use super::{DataLayer, DataLayerChange, StoreData, decode_hex_text};
use crate::config::RegistryConfig;
use crate::core::{RegistryError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// JSON-over-HTTP client of the data-layer RPC service.
pub struct RpcDataLayer {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    confirmation_attempts: u32,
    probe_timeout: Duration,
}

#[derive(Deserialize)]
struct CreateStoreResponse {
    id: String,
}

#[derive(Deserialize)]
struct RootResponse {
    #[serde(default)]
    confirmed: bool,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct KeysValuesResponse {
    #[serde(default)]
    keys_values: Vec<KeyValue>,
}

impl RpcDataLayer {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.datalayer_url.trim_end_matches('/').to_string(),
            poll_interval: config.confirmation_poll_interval,
            confirmation_attempts: config.confirmation_attempts,
            probe_timeout: config.probe_timeout,
        })
    }

    async fn rpc<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = format!("{}/{}", self.base_url, method);
        debug!(%url, "data layer rpc");

        let response: serde_json::Value = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let message = response
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(RegistryError::DataLayer(format!("{}: {}", method, message)));
        }

        Ok(serde_json::from_value(response)?)
    }

    async fn wait_for_confirmation(&self, store_id: &str) -> Result<()> {
        for attempt in 1..=self.confirmation_attempts {
            let root: RootResponse = self.rpc("get_root", json!({ "id": store_id })).await?;
            if root.confirmed {
                debug!(store_id, attempt, "store update confirmed");
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }
        warn!(
            store_id,
            attempts = self.confirmation_attempts,
            "store update never confirmed"
        );
        Err(RegistryError::SyncFailed(store_id.to_string()))
    }
}

#[async_trait]
impl DataLayer for RpcDataLayer {
    async fn create_store(&self) -> Result<String> {
        let created: CreateStoreResponse = self.rpc("create_data_store", json!({ "fee": 0 })).await?;
        self.wait_for_confirmation(&created.id).await?;
        Ok(created.id)
    }

    async fn push_changes(&self, store_id: &str, changes: &[DataLayerChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let _: serde_json::Value = self
            .rpc(
                "batch_update",
                json!({ "id": store_id, "changelist": changes }),
            )
            .await?;
        self.wait_for_confirmation(store_id).await
    }

    async fn get_subscribed_store_data(
        &self,
        store_id: &str,
        host: &str,
        port: u16,
    ) -> Result<StoreData> {
        self.subscribe_to_store(store_id, host, port).await?;

        let response: KeysValuesResponse = self
            .rpc("get_keys_values", json!({ "id": store_id }))
            .await?;

        response
            .keys_values
            .iter()
            .map(|kv| -> Result<(String, String)> {
                Ok((decode_hex_text(&kv.key)?, decode_hex_text(&kv.value)?))
            })
            .collect()
    }

    async fn subscribe_to_store(&self, store_id: &str, host: &str, port: u16) -> Result<()> {
        let urls = vec![format!("http://{}:{}", host, port)];
        let _: serde_json::Value = self
            .rpc("subscribe", json!({ "id": store_id, "urls": urls }))
            .await?;
        Ok(())
    }

    async fn probe_reachable(&self, host: &str, port: u16) -> bool {
        match timeout(self.probe_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!(host, port, error = %err, "peer unreachable");
                false
            }
            Err(_) => {
                debug!(host, port, "peer probe timed out");
                false
            }
        }
    }
}

//! Contract with the external content-addressed data layer
//!
//! Stores are opaque identifiers owned by the data layer. This crate only
//! creates them, writes keyed update sets with commit confirmation, reads
//! the materialized content of subscribed stores and subscribes to remote
//! stores.

pub mod rpc;
pub mod simulated;

pub use rpc::RpcDataLayer;
pub use simulated::SimulatedDataLayer;

use crate::core::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Materialized key/value content of a store.
pub type StoreData = BTreeMap<String, String>;

/// Action run when a store write cannot be confirmed.
pub type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Delete,
}

/// One entry of a store change list. Key and value are hex-encoded UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLayerChange {
    pub action: ChangeAction,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl DataLayerChange {
    pub fn insert(key: &str, value: &str) -> Self {
        Self {
            action: ChangeAction::Insert,
            key: hex::encode(key),
            value: Some(hex::encode(value)),
        }
    }

    pub fn delete(key: &str) -> Self {
        Self {
            action: ChangeAction::Delete,
            key: hex::encode(key),
            value: None,
        }
    }

    pub fn decoded_key(&self) -> Result<String> {
        decode_hex_text(&self.key)
    }

    pub fn decoded_value(&self) -> Result<Option<String>> {
        self.value.as_deref().map(decode_hex_text).transpose()
    }
}

/// Decodes a hex string (with or without a `0x` prefix) into UTF-8 text.
pub fn decode_hex_text(raw: &str) -> Result<String> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))?;
    Ok(String::from_utf8(bytes)?)
}

pub fn insert_changes(data: &StoreData) -> Vec<DataLayerChange> {
    data.iter()
        .map(|(key, value)| DataLayerChange::insert(key, value))
        .collect()
}

#[async_trait]
pub trait DataLayer: Send + Sync {
    /// Allocates a new store and returns its identifier.
    async fn create_store(&self) -> Result<String>;

    /// Applies a change list and waits for the commit to be confirmed.
    async fn push_changes(&self, store_id: &str, changes: &[DataLayerChange]) -> Result<()>;

    /// Writes `data` into a store. When the write cannot be confirmed,
    /// `on_failure` runs before the error is returned.
    async fn sync_store(
        &self,
        store_id: &str,
        data: &StoreData,
        on_failure: Compensation,
    ) -> Result<()> {
        match self.push_changes(store_id, &insert_changes(data)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                on_failure().await;
                Err(err)
            }
        }
    }

    /// Materialized content of a store served by `host:port`.
    async fn get_subscribed_store_data(
        &self,
        store_id: &str,
        host: &str,
        port: u16,
    ) -> Result<StoreData>;

    async fn subscribe_to_store(&self, store_id: &str, host: &str, port: u16) -> Result<()>;

    async fn probe_reachable(&self, host: &str, port: u16) -> bool;
}

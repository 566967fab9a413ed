use super::{ChangeAction, DataLayer, DataLayerChange, StoreData};
use crate::core::{RegistryError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct SimulatorState {
    stores: HashMap<String, StoreData>,
    created: Vec<String>,
    subscriptions: HashSet<String>,
    unreachable: HashSet<(String, u16)>,
    failing_stores: HashSet<String>,
    fail_push_call: Option<usize>,
    push_calls: usize,
}

/// In-process data layer: stores live in memory and commits confirm
/// immediately. Failures can be injected per store or per call.
pub struct SimulatedDataLayer {
    state: Mutex<SimulatorState>,
    latency: Mutex<Option<Duration>>,
}

impl SimulatedDataLayer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatorState::default()),
            latency: Mutex::new(None),
        }
    }

    /// Makes a store with the given content available, as if published by a peer.
    pub fn seed_store(&self, store_id: &str, data: StoreData) -> Result<()> {
        self.state.lock()?.stores.insert(store_id.to_string(), data);
        Ok(())
    }

    pub fn store(&self, store_id: &str) -> Result<Option<StoreData>> {
        Ok(self.state.lock()?.stores.get(store_id).cloned())
    }

    /// Identifiers allocated through `create_store`, in order.
    pub fn created_stores(&self) -> Result<Vec<String>> {
        Ok(self.state.lock()?.created.clone())
    }

    pub fn is_subscribed(&self, store_id: &str) -> Result<bool> {
        Ok(self.state.lock()?.subscriptions.contains(store_id))
    }

    pub fn mark_unreachable(&self, host: &str, port: u16) -> Result<()> {
        self.state
            .lock()?
            .unreachable
            .insert((host.to_string(), port));
        Ok(())
    }

    /// Every write to `store_id` fails to confirm.
    pub fn fail_writes_to(&self, store_id: &str) -> Result<()> {
        self.state
            .lock()?
            .failing_stores
            .insert(store_id.to_string());
        Ok(())
    }

    /// The `n`-th write (1-based, counted from now on) fails to confirm.
    pub fn fail_nth_write(&self, n: usize) -> Result<()> {
        let mut state = self.state.lock()?;
        state.fail_push_call = Some(state.push_calls + n);
        Ok(())
    }

    /// Delay applied to every call, for exercising timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) -> Result<()> {
        *self.latency.lock()? = latency;
        Ok(())
    }

    async fn simulate_latency(&self) -> Result<()> {
        let latency = *self.latency.lock()?;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn check_reachable(state: &SimulatorState, host: &str, port: u16) -> Result<()> {
        if state.unreachable.contains(&(host.to_string(), port)) {
            return Err(RegistryError::DataLayer(format!(
                "peer {}:{} is unreachable",
                host, port
            )));
        }
        Ok(())
    }
}

impl Default for SimulatedDataLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataLayer for SimulatedDataLayer {
    async fn create_store(&self) -> Result<String> {
        self.simulate_latency().await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut state = self.state.lock()?;
        state.stores.insert(id.clone(), StoreData::new());
        state.created.push(id.clone());
        debug!(store_id = %id, "simulated store created");
        Ok(id)
    }

    async fn push_changes(&self, store_id: &str, changes: &[DataLayerChange]) -> Result<()> {
        self.simulate_latency().await?;
        let mut state = self.state.lock()?;
        state.push_calls += 1;

        if state.fail_push_call == Some(state.push_calls) || state.failing_stores.contains(store_id)
        {
            return Err(RegistryError::SyncFailed(store_id.to_string()));
        }

        let mut decoded = Vec::with_capacity(changes.len());
        for change in changes {
            decoded.push((change.action, change.decoded_key()?, change.decoded_value()?));
        }

        let store = state
            .stores
            .entry(store_id.to_string())
            .or_default();
        for (action, key, value) in decoded {
            match action {
                ChangeAction::Insert => {
                    store.insert(key, value.unwrap_or_default());
                }
                ChangeAction::Delete => {
                    store.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn get_subscribed_store_data(
        &self,
        store_id: &str,
        host: &str,
        port: u16,
    ) -> Result<StoreData> {
        self.simulate_latency().await?;
        let mut state = self.state.lock()?;
        Self::check_reachable(&state, host, port)?;
        let data = state
            .stores
            .get(store_id)
            .cloned()
            .ok_or_else(|| RegistryError::DataLayer(format!("store '{}' not found", store_id)))?;
        state.subscriptions.insert(store_id.to_string());
        Ok(data)
    }

    async fn subscribe_to_store(&self, store_id: &str, host: &str, port: u16) -> Result<()> {
        self.simulate_latency().await?;
        let mut state = self.state.lock()?;
        Self::check_reachable(&state, host, port)?;
        state.subscriptions.insert(store_id.to_string());
        Ok(())
    }

    async fn probe_reachable(&self, host: &str, port: u16) -> bool {
        match self.state.lock() {
            Ok(state) => Self::check_reachable(&state, host, port).is_ok(),
            Err(_) => false,
        }
    }
}

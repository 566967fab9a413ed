use crate::core::{RegistryError, Result};
use crate::storage::Dialect;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Organization-store identifier used when running against the simulator.
pub const SIMULATOR_ORGANIZATION_ID: &str = "f1c54511-865e-4611-976c-7c3c1f704662";

/// Bound on a single external-store call unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How the identifier of a new home organization store is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreIdStrategy {
    /// Ask the data layer to create a fresh store.
    Remote,
    /// Reuse a well-known identifier instead of calling the data layer.
    Fixed(String),
}

impl StoreIdStrategy {
    pub fn simulator() -> Self {
        Self::Fixed(SIMULATOR_ORGANIZATION_ID.to_string())
    }
}

impl Default for StoreIdStrategy {
    fn default() -> Self {
        Self::Remote
    }
}

/// Execution of the mirror stage of a unit mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorMode {
    /// Await the mirror write before the primary write; failures are logged.
    Inline,
    /// Queue the mirror write for a background worker that applies writes
    /// in submission order; failures are logged.
    Detached,
}

impl Default for MirrorMode {
    fn default() -> Self {
        Self::Inline
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorPolicy {
    pub enabled: bool,
    pub mode: MirrorMode,
}

/// Registry configuration
///
/// Built with the builder methods below or read from the process
/// environment with [`RegistryConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Storage dialect, selects the full-text strategy
    pub dialect: Dialect,

    /// Home organization store allocation
    pub store_ids: StoreIdStrategy,

    /// Base URL of the data-layer RPC endpoint
    pub datalayer_url: String,

    /// Bound applied to every external-store call
    pub call_timeout: Duration,

    /// Delay between write-confirmation polls
    pub confirmation_poll_interval: Duration,

    /// Maximum write-confirmation polls before a write counts as failed
    pub confirmation_attempts: u32,

    /// Mirror store policy
    pub mirror: MirrorPolicy,

    /// Buffered change events per subscriber before it starts lagging
    pub change_bus_capacity: usize,

    /// Where the default peer organization list is published
    pub default_peers_url: Option<String>,

    /// Bound on a single peer reachability probe
    pub probe_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            store_ids: StoreIdStrategy::Remote,
            datalayer_url: "https://localhost:8562".to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            confirmation_poll_interval: Duration::from_secs(1),
            confirmation_attempts: 60,
            mirror: MirrorPolicy::default(),
            change_bus_capacity: 1024,
            default_peers_url: None,
            probe_timeout: Duration::from_secs(3),
        }
    }

    /// Use the fixed simulator organization identifier
    pub fn simulator(mut self) -> Self {
        self.store_ids = StoreIdStrategy::simulator();
        self
    }

    pub fn store_ids(mut self, strategy: StoreIdStrategy) -> Self {
        self.store_ids = strategy;
        self
    }

    pub fn datalayer_url(mut self, url: &str) -> Self {
        self.datalayer_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn confirmation(mut self, poll_interval: Duration, attempts: u32) -> Self {
        self.confirmation_poll_interval = poll_interval;
        self.confirmation_attempts = attempts;
        self
    }

    pub fn mirror(mut self, mode: MirrorMode) -> Self {
        self.mirror = MirrorPolicy {
            enabled: true,
            mode,
        };
        self
    }

    pub fn change_bus_capacity(mut self, capacity: usize) -> Self {
        self.change_bus_capacity = capacity;
        self
    }

    pub fn default_peers_url(mut self, url: &str) -> Self {
        self.default_peers_url = Some(url.to_string());
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Read configuration from the process environment
    ///
    /// Recognized variables: `DB_DIALECT` (`sqlite` | `mysql`, default
    /// `sqlite`), `USE_SIMULATOR`, `DATALAYER_URL`,
    /// `DEFAULT_ORGANIZATIONS_URL`, `MIRROR_DB`, `MIRROR_MODE`
    /// (`inline` | `detached`).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RegistryConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dialect = match lookup("DB_DIALECT") {
            Some(raw) => raw.parse()?,
            None => Dialect::Sqlite,
        };

        let mut config = Self::new(dialect);

        if lookup("USE_SIMULATOR").as_deref() == Some("true") {
            config = config.simulator();
        }
        if let Some(url) = lookup("DATALAYER_URL") {
            config = config.datalayer_url(&url);
        }
        if let Some(url) = lookup("DEFAULT_ORGANIZATIONS_URL") {
            config = config.default_peers_url(&url);
        }
        if lookup("MIRROR_DB").as_deref() == Some("true") {
            let mode = match lookup("MIRROR_MODE").as_deref() {
                None | Some("inline") => MirrorMode::Inline,
                Some("detached") => MirrorMode::Detached,
                Some(other) => {
                    return Err(RegistryError::Configuration(format!(
                        "unknown MIRROR_MODE '{}'",
                        other
                    )));
                }
            };
            config = config.mirror(mode);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.datalayer_url.is_empty() {
            return Err(RegistryError::Configuration(
                "datalayer_url cannot be empty".to_string(),
            ));
        }

        if self.call_timeout.is_zero() {
            return Err(RegistryError::Configuration(
                "call_timeout must be > 0".to_string(),
            ));
        }

        if self.confirmation_attempts == 0 {
            return Err(RegistryError::Configuration(
                "confirmation_attempts must be > 0".to_string(),
            ));
        }

        if self.change_bus_capacity == 0 {
            return Err(RegistryError::Configuration(
                "change_bus_capacity must be > 0".to_string(),
            ));
        }

        if let StoreIdStrategy::Fixed(id) = &self.store_ids
            && id.is_empty()
        {
            return Err(RegistryError::Configuration(
                "fixed organization store id cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new(Dialect::Sqlite)
    }
}

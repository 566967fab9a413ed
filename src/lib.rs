// ============================================================================
// Climate Warehouse Library
// ============================================================================

pub mod config;
pub mod core;
pub mod datalayer;
pub mod events;
pub mod registry;
pub mod search;
pub mod storage;
pub mod units;

// Re-export main types for convenience
pub use config::{MirrorMode, MirrorPolicy, RegistryConfig, StoreIdStrategy};
pub use core::{Criteria, Record, RegistryError, Result, Value};
pub use datalayer::{DataLayer, RpcDataLayer, SimulatedDataLayer};
pub use events::{ChangeBus, ChangeEvent, ChangeSubscription};
pub use registry::{Organization, OrganizationRegistry, OrganizationSummary, OrganizationView};
pub use search::{Pagination, SearchDispatcher, SearchResult};
pub use storage::{Dialect, InMemoryStorage, Persistence};
pub use units::UnitStore;

use std::sync::Arc;
use tracing::info;

// ============================================================================
// Assembled registry backend
// ============================================================================

/// The registry backend with every component wired to one change bus.
///
/// # Examples
///
/// ```
/// use climate_warehouse::{Record, RegistryConfig, Warehouse};
///
/// # tokio_test::block_on(async {
/// let warehouse = Warehouse::simulated(RegistryConfig::default()).unwrap();
/// let mut changes = warehouse.changes().subscribe();
///
/// let org = warehouse.organizations().create_home("Home", "icon.png").await.unwrap();
/// warehouse
///     .units()
///     .create(Record::new().with("orgUid", org.as_str()).with("serialNumberBlock", "A1-A10"))
///     .await
///     .unwrap();
///
/// assert_eq!(changes.try_recv().unwrap().organization_id, org);
/// # });
/// ```
pub struct Warehouse {
    config: RegistryConfig,
    changes: ChangeBus,
    organizations: OrganizationRegistry,
    units: UnitStore,
    search: SearchDispatcher,
}

impl Warehouse {
    /// Wire the components over the given stores.
    ///
    /// The primary store must speak the configured dialect. The mirror is
    /// only used when the configuration enables it.
    pub fn open(
        config: RegistryConfig,
        primary: Arc<dyn Persistence>,
        mirror: Option<Arc<dyn Persistence>>,
        data_layer: Arc<dyn DataLayer>,
    ) -> Result<Self> {
        config.validate()?;
        let search = SearchDispatcher::for_dialect(config.dialect, primary.clone())?
            .with_call_timeout(config.call_timeout);
        let changes = ChangeBus::with_capacity(config.change_bus_capacity);
        let organizations = OrganizationRegistry::new(primary.clone(), data_layer, &config)?;
        let units = UnitStore::from_config(&config, primary, mirror, changes.clone());

        info!(
            dialect = %config.dialect,
            mirror = config.mirror.enabled,
            "warehouse opened"
        );
        Ok(Self {
            config,
            changes,
            organizations,
            units,
            search,
        })
    }

    /// In-memory stores over the simulated data layer.
    pub fn simulated(config: RegistryConfig) -> Result<Self> {
        let data_layer = Arc::new(SimulatedDataLayer::new());
        Self::in_memory(config, data_layer)
    }

    /// In-memory stores over the data-layer RPC endpoint in `config`.
    pub fn connect(config: RegistryConfig) -> Result<Self> {
        let data_layer = Arc::new(RpcDataLayer::new(&config)?);
        Self::in_memory(config, data_layer)
    }

    fn in_memory(config: RegistryConfig, data_layer: Arc<dyn DataLayer>) -> Result<Self> {
        let primary = Arc::new(InMemoryStorage::for_registry(config.dialect)?);
        let mirror: Option<Arc<dyn Persistence>> = if config.mirror.enabled {
            Some(Arc::new(InMemoryStorage::for_registry(config.dialect)?))
        } else {
            None
        };
        Self::open(config, primary, mirror, data_layer)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn changes(&self) -> &ChangeBus {
        &self.changes
    }

    pub fn organizations(&self) -> &OrganizationRegistry {
        &self.organizations
    }

    pub fn units(&self) -> &UnitStore {
        &self.units
    }

    pub fn search(&self) -> &SearchDispatcher {
        &self.search
    }

    /// Closes the change bus; subscribers drain and then end.
    pub fn shutdown(&self) {
        self.changes.close();
        info!("warehouse shut down");
    }
}

use super::peers::{DefaultOrganization, DefaultOrganizationSource, HttpDefaultOrganizations};
use super::{
    DEFAULT_DATA_VERSION, ICON, IS_HOME, NAME, ORG_UID, Organization, OrganizationSummary,
    OrganizationView, REGISTRY_ID, SUBSCRIBED,
};
use crate::config::{RegistryConfig, StoreIdStrategy};
use crate::core::{Criteria, Record, RegistryError, Result, bounded};
use crate::datalayer::{Compensation, DataLayer, StoreData};
use crate::storage::{ORGANIZATIONS_TABLE, Persistence};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{Instrument, Level, event, info_span};

/// Undoes a failed home-organization bootstrap.
///
/// Removes the local home row written by this bootstrap, identified by its
/// own version store, so a concurrent bootstrap sharing the organization id
/// keeps its row. The remote stores already allocated are left in place and
/// reported for manual reconciliation.
#[derive(Clone)]
struct BootstrapRollback {
    persistence: Arc<dyn Persistence>,
    org_uid: String,
    registry_store: String,
    version_store: String,
}

impl BootstrapRollback {
    async fn run(self) {
        let criteria = Criteria::new()
            .eq(ORG_UID, self.org_uid.as_str())
            .eq(IS_HOME, true)
            .eq(REGISTRY_ID, self.version_store.as_str());
        if let Err(err) = self.persistence.destroy(ORGANIZATIONS_TABLE, &criteria).await {
            event!(Level::ERROR, org_uid = %self.org_uid, error = %err, "rollback could not remove organization row");
        }
        event!(
            Level::WARN,
            organization_store = %self.org_uid,
            registry_store = %self.registry_store,
            version_store = %self.version_store,
            "home organization bootstrap rolled back; remote stores left orphaned"
        );
    }

    fn compensation(&self) -> Compensation {
        let rollback = self.clone();
        Box::new(move || rollback.run().boxed())
    }
}

/// Organization lifecycle against local storage and the data layer.
#[derive(Clone)]
pub struct OrganizationRegistry {
    persistence: Arc<dyn Persistence>,
    data_layer: Arc<dyn DataLayer>,
    default_peers: Option<Arc<dyn DefaultOrganizationSource>>,
    store_ids: StoreIdStrategy,
    call_timeout: Duration,
}

impl OrganizationRegistry {
    /// Builds the registry; a configured default peer URL installs an
    /// HTTP list provider.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        data_layer: Arc<dyn DataLayer>,
        config: &RegistryConfig,
    ) -> Result<Self> {
        let default_peers = match &config.default_peers_url {
            Some(url) => Some(Arc::new(HttpDefaultOrganizations::new(url, config.call_timeout)?)
                as Arc<dyn DefaultOrganizationSource>),
            None => None,
        };
        Ok(Self {
            persistence,
            data_layer,
            default_peers,
            store_ids: config.store_ids.clone(),
            call_timeout: config.call_timeout,
        })
    }

    pub fn with_default_peers(mut self, source: Arc<dyn DefaultOrganizationSource>) -> Self {
        self.default_peers = Some(source);
        self
    }

    async fn bounded<T>(&self, call: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(self.call_timeout, call, work).await
    }

    async fn find(&self, org_uid: &str) -> Result<Option<Organization>> {
        let row = self
            .bounded(
                "organization lookup",
                self.persistence
                    .find_one(ORGANIZATIONS_TABLE, &Criteria::new().eq(ORG_UID, org_uid)),
            )
            .await?;
        row.as_ref().map(Organization::from_record).transpose()
    }

    async fn home(&self) -> Result<Option<Organization>> {
        let row = self
            .bounded(
                "home organization lookup",
                self.persistence
                    .find_one(ORGANIZATIONS_TABLE, &Criteria::new().eq(IS_HOME, true)),
            )
            .await?;
        row.as_ref().map(Organization::from_record).transpose()
    }

    /// The home organization's public projection, if one exists.
    pub async fn get_home(&self) -> Result<Option<OrganizationSummary>> {
        Ok(self.home().await?.map(|org| org.summary()))
    }

    /// Every known organization keyed by `orgUid`.
    pub async fn get_all_as_map(&self) -> Result<HashMap<String, OrganizationView>> {
        let rows = self
            .bounded(
                "organization listing",
                self.persistence.find_all(ORGANIZATIONS_TABLE, &Criteria::new()),
            )
            .await?;
        rows.iter()
            .map(|row| Organization::from_record(row).map(|org| (org.org_uid.clone(), org.view())))
            .collect()
    }

    pub async fn create_home(&self, name: &str, icon: &str) -> Result<String> {
        self.create_home_with_version(name, icon, DEFAULT_DATA_VERSION).await
    }

    /// Creates the home organization and its store chain, or returns the
    /// existing home organization's id.
    ///
    /// Each store write must be confirmed before the next starts. A failed
    /// or timed-out write rolls back and fails the call.
    pub async fn create_home_with_version(
        &self,
        name: &str,
        icon: &str,
        data_version: &str,
    ) -> Result<String> {
        if let Some(home) = self.home().await? {
            return Ok(home.org_uid);
        }

        let span = info_span!("organization.create_home", name);
        async move {
            let org_uid = match &self.store_ids {
                StoreIdStrategy::Fixed(id) => id.clone(),
                StoreIdStrategy::Remote => {
                    self.bounded("organization store creation", self.data_layer.create_store())
                        .await?
                }
            };
            let registry_store = self
                .bounded("registry store creation", self.data_layer.create_store())
                .await?;
            let version_store = self
                .bounded("version store creation", self.data_layer.create_store())
                .await?;

            let rollback = BootstrapRollback {
                persistence: self.persistence.clone(),
                org_uid: org_uid.clone(),
                registry_store: registry_store.clone(),
                version_store: version_store.clone(),
            };

            let organization_data: StoreData = [
                (REGISTRY_ID.to_string(), registry_store.clone()),
                (NAME.to_string(), name.to_string()),
                (ICON.to_string(), icon.to_string()),
            ]
            .into_iter()
            .collect();
            self.sync_or_rollback(&org_uid, &organization_data, &rollback)
                .await?;

            let registry_data: StoreData = [(data_version.to_string(), version_store.clone())]
                .into_iter()
                .collect();
            self.sync_or_rollback(&registry_store, &registry_data, &rollback)
                .await?;

            let home = Organization {
                org_uid: org_uid.clone(),
                name: Some(name.to_string()),
                icon: Some(icon.to_string()),
                registry_id: Some(version_store.clone()),
                is_home: true,
                subscribed: true,
            };
            let created = self
                .bounded(
                    "home organization insert",
                    self.persistence.create(ORGANIZATIONS_TABLE, home.to_record()),
                )
                .await;

            match created {
                Ok(_) => {
                    event!(Level::INFO, org_uid = %org_uid, "home organization created");
                    Ok(org_uid)
                }
                Err(err) if err.is_constraint_violation() => {
                    // Lost a race with a concurrent bootstrap; the winner's row stands.
                    let winner = self.home().await?.ok_or(err)?;
                    event!(
                        Level::WARN,
                        home = %winner.org_uid,
                        organization_store = %org_uid,
                        registry_store = %registry_store,
                        version_store = %version_store,
                        "home organization already created concurrently; stores left orphaned"
                    );
                    Ok(winner.org_uid)
                }
                Err(err) => Err(err),
            }
        }
        .instrument(span)
        .await
    }

    async fn sync_or_rollback(
        &self,
        store_id: &str,
        data: &StoreData,
        rollback: &BootstrapRollback,
    ) -> Result<()> {
        let synced = self
            .bounded(
                "store sync",
                self.data_layer
                    .sync_store(store_id, data, rollback.compensation()),
            )
            .await;
        if let Err(err) = &synced {
            event!(Level::ERROR, store_id, error = %err, "store sync failed");
            // A timeout drops the sync before its compensation can run.
            if matches!(err, RegistryError::Timeout(_)) {
                rollback.clone().run().await;
            }
        }
        synced
    }

    /// Imports a remote organization, returning errors to the caller.
    ///
    /// The organization store must name a registry store, and the registry
    /// store must hold a `v1` version store; the version store is then
    /// subscribed to and the local row upserted as a foreign, subscribed
    /// organization. The home organization is never overwritten.
    pub async fn try_import_organization(
        &self,
        org_uid: &str,
        host: &str,
        port: u16,
    ) -> Result<Organization> {
        if let Some(existing) = self.find(org_uid).await?
            && existing.is_home
        {
            event!(Level::DEBUG, org_uid, "home organization is not imported");
            return Ok(existing);
        }

        event!(Level::INFO, org_uid, host, port, "subscribing to organization");
        let org_data = self
            .bounded(
                "organization store fetch",
                self.data_layer.get_subscribed_store_data(org_uid, host, port),
            )
            .await?;

        let registry_id = org_data
            .get(REGISTRY_ID)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RegistryError::CorruptedOrganization(org_uid.to_string()))?;

        event!(Level::INFO, org_uid, registry_id = %registry_id, "importing registry");
        let registry_data = self
            .bounded(
                "registry store fetch",
                self.data_layer
                    .get_subscribed_store_data(registry_id, host, port),
            )
            .await?;

        let version_store = registry_data
            .get(DEFAULT_DATA_VERSION)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RegistryError::MissingRegistry(org_uid.to_string()))?;

        event!(Level::INFO, org_uid, version_store = %version_store, "importing registry v1");
        self.bounded(
            "version store subscription",
            self.data_layer.subscribe_to_store(version_store, host, port),
        )
        .await?;

        let organization = Organization {
            org_uid: org_uid.to_string(),
            name: org_data.get(NAME).cloned(),
            icon: org_data.get(ICON).cloned(),
            registry_id: Some(version_store.clone()),
            is_home: false,
            subscribed: true,
        };
        self.bounded(
            "organization upsert",
            self.persistence
                .upsert(ORGANIZATIONS_TABLE, ORG_UID, organization.to_record()),
        )
        .await?;

        event!(Level::INFO, org_uid, "organization imported");
        Ok(organization)
    }

    /// Best-effort import: failures are logged, never returned.
    pub async fn import_organization(&self, org_uid: &str, host: &str, port: u16) {
        if let Err(err) = self.try_import_organization(org_uid, host, port).await {
            event!(Level::WARN, org_uid, host, port, error = %err, "organization import failed");
        }
    }

    /// Marks an imported organization as subscribed.
    pub async fn subscribe(&self, org_uid: &str) -> Result<()> {
        if self.find(org_uid).await?.is_none() {
            return Err(RegistryError::NotImported(org_uid.to_string()));
        }
        self.set_subscribed(org_uid, true).await
    }

    /// Marks an organization as unsubscribed. Unknown ids are ignored.
    pub async fn unsubscribe(&self, org_uid: &str) -> Result<()> {
        self.set_subscribed(org_uid, false).await
    }

    async fn set_subscribed(&self, org_uid: &str, subscribed: bool) -> Result<()> {
        let changes = Record::new().with(SUBSCRIBED, subscribed);
        let criteria = Criteria::new().eq(ORG_UID, org_uid);
        let affected = self
            .bounded(
                "subscription update",
                self.persistence
                    .update(ORGANIZATIONS_TABLE, &changes, &criteria),
            )
            .await?;
        event!(Level::DEBUG, org_uid, subscribed, affected, "subscription updated");
        Ok(())
    }

    /// Imports every reachable default peer not known locally.
    ///
    /// One task per peer; all tasks are awaited and each task's failure is
    /// logged on its own. Returns the ids imported by this call. Never fails:
    /// an unavailable or malformed list is logged and yields nothing.
    pub async fn subscribe_to_defaults(&self) -> Vec<String> {
        let Some(source) = self.default_peers.clone() else {
            event!(Level::DEBUG, "no default organization list configured");
            return Vec::new();
        };

        let list = match self
            .bounded("default organization list", source.default_organizations())
            .await
        {
            Ok(list) => list,
            Err(err) => {
                event!(Level::ERROR, error = %err, "default organization list unavailable, this instance may be missing data from default organizations");
                return Vec::new();
            }
        };
        let Some(entries) = list.as_array() else {
            event!(Level::ERROR, "default organization list is not a list, this instance may be missing data from default organizations");
            return Vec::new();
        };

        let known = match self.get_all_as_map().await {
            Ok(known) => known,
            Err(err) => {
                event!(Level::ERROR, error = %err, "could not list local organizations");
                return Vec::new();
            }
        };

        let mut tasks: JoinSet<Result<String>> = JoinSet::new();
        for entry in entries {
            let peer = match DefaultOrganization::from_json(entry) {
                Ok(peer) => peer,
                Err(err) => {
                    event!(Level::WARN, entry = %entry, error = %err, "skipping malformed default organization");
                    continue;
                }
            };
            if known.contains_key(&peer.org_uid) {
                continue;
            }

            let registry = self.clone();
            tasks.spawn(async move {
                let reachable = registry
                    .bounded("peer probe", async {
                        Ok::<_, RegistryError>(
                            registry.data_layer.probe_reachable(&peer.ip, peer.port).await,
                        )
                    })
                    .await?;
                if !reachable {
                    return Err(RegistryError::DataLayer(format!(
                        "peer {}:{} is unreachable",
                        peer.ip, peer.port
                    )));
                }
                registry
                    .try_import_organization(&peer.org_uid, &peer.ip, peer.port)
                    .await
                    .map(|org| org.org_uid)
            });
        }

        let mut imported = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(org_uid)) => imported.push(org_uid),
                Ok(Err(err)) => {
                    event!(Level::WARN, error = %err, "default organization not imported")
                }
                Err(err) => event!(Level::ERROR, error = %err, "default organization import task failed"),
            }
        }
        imported.sort();
        imported
    }
}

use super::{ENTITY_TYPE, OWNER_COLUMN, PRIMARY_KEY, derive_block_fields, strip_non_persisted};
use crate::config::{DEFAULT_CALL_TIMEOUT, MirrorMode, RegistryConfig};
use crate::core::{Criteria, Record, RegistryError, Result, bounded};
use crate::events::{ChangeBus, ChangeEvent};
use crate::storage::{Persistence, UNITS_TABLE};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Instrument, Level, event, info_span};

/// Work shipped to the mirror database ahead of the primary write.
#[derive(Debug, Clone)]
enum MirrorWrite {
    Create(Record),
    Destroy(Criteria),
}

impl MirrorWrite {
    fn describe(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Destroy(_) => "destroy",
        }
    }

    async fn apply(&self, mirror: &dyn Persistence) -> Result<()> {
        match self {
            Self::Create(values) => mirror.create(UNITS_TABLE, values.clone()).await.map(|_| ()),
            Self::Destroy(criteria) => mirror.destroy(UNITS_TABLE, criteria).await.map(|_| ()),
        }
    }
}

#[derive(Clone)]
struct MirrorTarget {
    store: Arc<dyn Persistence>,
    mode: MirrorMode,
    /// Detached writes, applied one at a time in submission order.
    queue: Arc<OnceLock<mpsc::UnboundedSender<MirrorWrite>>>,
}

fn record_mirror_failure(failures: &AtomicU64, operation: &str, err: &RegistryError) {
    failures.fetch_add(1, AtomicOrdering::Relaxed);
    event!(Level::ERROR, operation, error = %err, "mirror write failed");
}

fn spawn_mirror_worker(
    store: Arc<dyn Persistence>,
    call_timeout: Duration,
    failures: Arc<AtomicU64>,
) -> mpsc::UnboundedSender<MirrorWrite> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<MirrorWrite>();
    tokio::spawn(async move {
        while let Some(write) = receiver.recv().await {
            let applied = bounded(call_timeout, "mirror write", write.apply(store.as_ref())).await;
            if let Err(err) = applied {
                record_mirror_failure(&failures, write.describe(), &err);
            }
        }
        event!(Level::DEBUG, "mirror worker stopped");
    });
    sender
}

/// The only write path for units.
///
/// Every mutation runs in two named stages:
///
/// - **mirror stage**: the same write against the mirror database, if one
///   is configured. Its outcome is logged and counted, never returned.
/// - **primary stage**: the authoritative write. Its outcome is returned,
///   and on success exactly one change event per owning organization is
///   published.
#[derive(Clone)]
pub struct UnitStore {
    primary: Arc<dyn Persistence>,
    mirror: Option<MirrorTarget>,
    changes: ChangeBus,
    call_timeout: Duration,
    mirror_failures: Arc<AtomicU64>,
}

impl UnitStore {
    pub fn new(primary: Arc<dyn Persistence>, changes: ChangeBus) -> Self {
        Self {
            primary,
            mirror: None,
            changes,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            mirror_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn Persistence>, mode: MirrorMode) -> Self {
        self.mirror = Some(MirrorTarget {
            store: mirror,
            mode,
            queue: Arc::new(OnceLock::new()),
        });
        self
    }

    /// Bound on each primary and mirror call.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Attaches `mirror` only when the configuration enables mirroring.
    pub fn from_config(
        config: &RegistryConfig,
        primary: Arc<dyn Persistence>,
        mirror: Option<Arc<dyn Persistence>>,
        changes: ChangeBus,
    ) -> Self {
        let store = Self::new(primary, changes).with_call_timeout(config.call_timeout);
        match mirror {
            Some(mirror) if config.mirror.enabled => store.with_mirror(mirror, config.mirror.mode),
            _ => store,
        }
    }

    /// Mirror-stage failures observed so far.
    pub fn mirror_failures(&self) -> u64 {
        self.mirror_failures.load(AtomicOrdering::Relaxed)
    }

    /// Stores a new unit and publishes its change event.
    ///
    /// A `warehouseUnitId` is assigned when `values` lacks one. Derived
    /// block fields are dropped before writing and recomputed on the result.
    pub async fn create(&self, mut values: Record) -> Result<Record> {
        strip_non_persisted(&mut values);
        if values.get(PRIMARY_KEY).is_none_or(|v| v.is_null()) {
            values.set(PRIMARY_KEY, uuid::Uuid::new_v4().to_string());
        }
        let owner = values
            .get_str(OWNER_COLUMN)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                RegistryError::ConstraintViolation(format!(
                    "unit requires an owning '{}'",
                    OWNER_COLUMN
                ))
            })?;

        let span = info_span!("unit.create", organization = %owner);
        async move {
            self.mirror_stage(MirrorWrite::Create(values.clone())).await;

            let mut created = self
                .bounded("unit insert", self.primary.create(UNITS_TABLE, values))
                .await?;
            self.changes.publish(ChangeEvent::new(ENTITY_TYPE, owner));
            event!(Level::DEBUG, "unit created");

            derive_block_fields(&mut created);
            Ok(created)
        }
        .instrument(span)
        .await
    }

    /// Removes the units matching `criteria` and publishes their change events.
    ///
    /// The matching record is read first: the criteria alone need not carry
    /// the owning organization. Nothing is written when no record matches.
    pub async fn destroy(&self, criteria: &Criteria) -> Result<Record> {
        let matched = self
            .bounded("unit lookup", self.primary.find_all(UNITS_TABLE, criteria))
            .await?;
        let Some(first) = matched.first().cloned() else {
            return Err(RegistryError::NotFound(
                UNITS_TABLE.to_string(),
                criteria.to_string(),
            ));
        };

        let span = info_span!("unit.destroy", criteria = %criteria);
        async move {
            self.mirror_stage(MirrorWrite::Destroy(criteria.clone())).await;

            self.bounded("unit delete", self.primary.destroy(UNITS_TABLE, criteria))
                .await?;

            let owners: BTreeSet<&str> = matched
                .iter()
                .filter_map(|row| row.get_str(OWNER_COLUMN))
                .collect();
            for owner in owners {
                self.changes.publish(ChangeEvent::new(ENTITY_TYPE, owner));
            }
            event!(Level::DEBUG, removed = matched.len(), "units destroyed");

            let mut removed = first;
            derive_block_fields(&mut removed);
            Ok(removed)
        }
        .instrument(span)
        .await
    }

    pub async fn find_one(&self, criteria: &Criteria) -> Result<Option<Record>> {
        let mut found = self
            .bounded("unit lookup", self.primary.find_one(UNITS_TABLE, criteria))
            .await?;
        if let Some(record) = found.as_mut() {
            derive_block_fields(record);
        }
        Ok(found)
    }

    pub async fn find_all(&self, criteria: &Criteria) -> Result<Vec<Record>> {
        let mut rows = self
            .bounded("unit listing", self.primary.find_all(UNITS_TABLE, criteria))
            .await?;
        rows.iter_mut().for_each(derive_block_fields);
        Ok(rows)
    }

    async fn bounded<T>(
        &self,
        call: &str,
        work: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        bounded(self.call_timeout, call, work).await
    }

    /// Stage 1. Never fails the caller, and never waits past the call
    /// timeout.
    async fn mirror_stage(&self, write: MirrorWrite) {
        let Some(target) = self.mirror.as_ref() else {
            return;
        };

        match target.mode {
            MirrorMode::Inline => {
                let applied = self
                    .bounded("mirror write", write.apply(target.store.as_ref()))
                    .await;
                if let Err(err) = applied {
                    record_mirror_failure(&self.mirror_failures, write.describe(), &err);
                }
            }
            MirrorMode::Detached => {
                let queue = target.queue.get_or_init(|| {
                    spawn_mirror_worker(
                        target.store.clone(),
                        self.call_timeout,
                        self.mirror_failures.clone(),
                    )
                });
                let operation = write.describe();
                if queue.send(write).is_err() {
                    let err = RegistryError::Storage("mirror worker is gone".to_string());
                    record_mirror_failure(&self.mirror_failures, operation, &err);
                }
            }
        }
    }
}

/// Mirrored unit write tests
///
/// Mirror and primary stages of unit mutations and the change events they
/// publish.
/// Run with: cargo test --test mirrored_write_tests

use async_trait::async_trait;
use climate_warehouse::storage::{Replacements, UNITS_TABLE};
use climate_warehouse::{
    ChangeBus, ChangeEvent, Criteria, Dialect, InMemoryStorage, MirrorMode, Persistence, Record,
    RegistryConfig, RegistryError, UnitStore, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// A store whose every call waits forever.
struct StalledStore;

#[async_trait]
impl Persistence for StalledStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
    async fn create(&self, _table: &str, _values: Record) -> climate_warehouse::Result<Record> {
        std::future::pending().await
    }
    async fn find_one(
        &self,
        _table: &str,
        _criteria: &Criteria,
    ) -> climate_warehouse::Result<Option<Record>> {
        std::future::pending().await
    }
    async fn find_all(&self, _table: &str, _criteria: &Criteria) -> climate_warehouse::Result<Vec<Record>> {
        std::future::pending().await
    }
    async fn update(
        &self,
        _table: &str,
        _changes: &Record,
        _criteria: &Criteria,
    ) -> climate_warehouse::Result<usize> {
        std::future::pending().await
    }
    async fn destroy(&self, _table: &str, _criteria: &Criteria) -> climate_warehouse::Result<usize> {
        std::future::pending().await
    }
    async fn raw_query(
        &self,
        _sql: &str,
        _replacements: &Replacements,
    ) -> climate_warehouse::Result<Vec<Record>> {
        std::future::pending().await
    }
}

fn storage() -> Arc<InMemoryStorage> {
    Arc::new(InMemoryStorage::for_registry(Dialect::Sqlite).unwrap())
}

fn unit(org: &str, block: &str) -> Record {
    Record::new()
        .with("orgUid", org)
        .with("serialNumberBlock", block)
        .with("unitStatus", "Held")
}

fn drain(subscription: &mut climate_warehouse::ChangeSubscription) -> Vec<ChangeEvent> {
    let mut events = vec![];
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_each_mutation_emits_one_event() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let units = UnitStore::new(storage(), bus.clone());

    let mut expected: HashMap<String, Vec<String>> = HashMap::new();
    let mut created_ids = vec![];
    for (i, org) in ["org-a", "org-b", "org-a", "org-c", "org-b"].iter().enumerate() {
        let created = assert_ok!(units.create(unit(org, &format!("A{}-A{}", i, i + 10))).await);
        created_ids.push((org.to_string(), created.get_str("warehouseUnitId").unwrap().to_string()));
        expected.entry(org.to_string()).or_default().push(format!("create {}", i));
    }
    for (org, id) in created_ids.iter().take(3) {
        assert_ok!(units.destroy(&Criteria::new().eq("warehouseUnitId", id.as_str())).await);
        expected.entry(org.clone()).or_default().push(format!("destroy {}", id));
    }

    let events = drain(&mut subscription);
    assert_eq!(events.len(), 8);
    assert!(events.iter().all(|e| e.entity_type == "units"));

    let mut per_org: HashMap<String, usize> = HashMap::new();
    for event in &events {
        *per_org.entry(event.organization_id.clone()).or_default() += 1;
    }
    for (org, mutations) in &expected {
        assert_eq!(per_org[org], mutations.len(), "events for {}", org);
    }
}

#[tokio::test]
async fn test_events_follow_mutation_order_per_organization() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let units = UnitStore::new(storage(), bus.clone());

    let first = units.create(unit("org-a", "A1-A2")).await.unwrap();
    units.create(unit("org-b", "B1-B2")).await.unwrap();
    let id = first.get_str("warehouseUnitId").unwrap().to_string();
    units
        .destroy(&Criteria::new().eq("warehouseUnitId", id.as_str()))
        .await
        .unwrap();

    assert_eq!(
        drain(&mut subscription),
        vec![
            ChangeEvent::new("units", "org-a"),
            ChangeEvent::new("units", "org-b"),
            ChangeEvent::new("units", "org-a"),
        ]
    );
}

#[tokio::test]
async fn test_destroy_without_match_emits_nothing() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let primary = storage();
    let units = UnitStore::new(primary.clone(), bus);
    units.create(unit("org-a", "A1-A2")).await.unwrap();
    drain(&mut subscription);

    let err = assert_err!(units.destroy(&Criteria::new().eq("warehouseUnitId", "missing")).await);
    assert!(matches!(err, RegistryError::NotFound(_, _)));
    assert!(drain(&mut subscription).is_empty());
    assert_eq!(primary.row_count(UNITS_TABLE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_destroy_by_criteria_without_owner() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let units = UnitStore::new(storage(), bus);
    units.create(unit("org-a", "SER1-SER5")).await.unwrap();
    drain(&mut subscription);

    let removed = units
        .destroy(&Criteria::new().eq("serialNumberBlock", "SER1-SER5"))
        .await
        .unwrap();
    assert_eq!(removed.get("unitCount"), Some(&Value::Integer(4)));
    assert_eq!(drain(&mut subscription), vec![ChangeEvent::new("units", "org-a")]);
}

#[tokio::test]
async fn test_mirror_is_a_physical_replica() {
    let primary = storage();
    let mirror = storage();
    let config = RegistryConfig::default().mirror(MirrorMode::Inline);
    let units = UnitStore::from_config(&config, primary.clone(), Some(mirror.clone()), ChangeBus::new());

    let created = units.create(unit("org-a", "ABC100-ABC149")).await.unwrap();
    let id = created.get_str("warehouseUnitId").unwrap().to_string();

    let mirrored = mirror
        .find_one(UNITS_TABLE, &Criteria::new().eq("warehouseUnitId", id.as_str()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirrored.get_str("serialNumberBlock"), Some("ABC100-ABC149"));
    // Derived fields are never written.
    assert!(!mirrored.contains("unitCount"));
    assert!(created.contains("unitCount"));
}

#[tokio::test]
async fn test_mirror_outage_degrades_without_failing() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let primary = storage();
    let mirror = storage();
    let units = UnitStore::new(primary.clone(), bus).with_mirror(mirror.clone(), MirrorMode::Inline);

    mirror.set_offline(true);
    let created = assert_ok!(units.create(unit("org-a", "A1-A9")).await);
    let id = created.get_str("warehouseUnitId").unwrap().to_string();
    assert_ok!(units.destroy(&Criteria::new().eq("warehouseUnitId", id.as_str())).await);

    assert_eq!(units.mirror_failures(), 2);
    assert_eq!(drain(&mut subscription).len(), 2);

    mirror.set_offline(false);
    units.create(unit("org-a", "A10-A19")).await.unwrap();
    assert_eq!(units.mirror_failures(), 2);
    assert_eq!(mirror.row_count(UNITS_TABLE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_detached_mirror_catches_up() {
    let primary = storage();
    let mirror = storage();
    let units =
        UnitStore::new(primary.clone(), ChangeBus::new()).with_mirror(mirror.clone(), MirrorMode::Detached);

    for i in 0..5 {
        units.create(unit("org-a", &format!("A{}-A{}", i, i + 1))).await.unwrap();
    }
    assert_eq!(primary.row_count(UNITS_TABLE).await.unwrap(), 5);

    let mut replicated = 0;
    for _ in 0..50 {
        replicated = mirror.row_count(UNITS_TABLE).await.unwrap();
        if replicated == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(replicated, 5);
}

#[tokio::test]
async fn test_primary_failure_is_returned_and_silent() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let primary = storage();
    let units = UnitStore::new(primary.clone(), bus);

    primary.set_offline(true);
    assert_err!(units.create(unit("org-a", "A1-A2")).await);
    assert!(drain(&mut subscription).is_empty());
}

#[tokio::test]
async fn test_stalled_inline_mirror_cannot_hold_up_primary() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let primary = storage();
    let units = UnitStore::new(primary.clone(), bus)
        .with_mirror(Arc::new(StalledStore), MirrorMode::Inline)
        .with_call_timeout(Duration::from_millis(50));

    let created = tokio::time::timeout(Duration::from_secs(2), units.create(unit("org-a", "A1-A9")))
        .await
        .expect("create finishes despite the stalled mirror");
    let id = assert_ok!(created).get_str("warehouseUnitId").unwrap().to_string();
    assert_eq!(primary.row_count(UNITS_TABLE).await.unwrap(), 1);

    let destroyed = tokio::time::timeout(
        Duration::from_secs(2),
        units.destroy(&Criteria::new().eq("warehouseUnitId", id.as_str())),
    )
    .await
    .expect("destroy finishes despite the stalled mirror");
    assert_ok!(destroyed);

    assert_eq!(primary.row_count(UNITS_TABLE).await.unwrap(), 0);
    assert_eq!(units.mirror_failures(), 2);
    assert_eq!(drain(&mut subscription).len(), 2);
}

#[tokio::test]
async fn test_stalled_primary_times_out_without_event() {
    let bus = ChangeBus::new();
    let mut subscription = bus.subscribe();
    let config = RegistryConfig::default().call_timeout(Duration::from_millis(50));
    let units = UnitStore::from_config(&config, Arc::new(StalledStore), None, bus);

    let err = assert_err!(units.create(unit("org-a", "A1-A2")).await);
    assert!(matches!(err, RegistryError::Timeout(_)));
    let err = assert_err!(units.destroy(&Criteria::new().eq("warehouseUnitId", "u1")).await);
    assert!(matches!(err, RegistryError::Timeout(_)));
    assert!(drain(&mut subscription).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detached_mirror_applies_writes_in_order() {
    let primary = storage();
    let mirror = storage();
    let units =
        UnitStore::new(primary.clone(), ChangeBus::new()).with_mirror(mirror.clone(), MirrorMode::Detached);

    for i in 0..25 {
        let created = units.create(unit("org-a", &format!("A{}-A{}", i, i + 1))).await.unwrap();
        let id = created.get_str("warehouseUnitId").unwrap().to_string();
        units
            .destroy(&Criteria::new().eq("warehouseUnitId", id.as_str()))
            .await
            .unwrap();
    }
    let marker = units.create(unit("org-a", "M1-M2")).await.unwrap();
    let marker_id = marker.get_str("warehouseUnitId").unwrap().to_string();

    // The marker is the last write queued; once it lands everything before it has.
    let mut landed = false;
    for _ in 0..100 {
        let found = mirror
            .find_one(UNITS_TABLE, &Criteria::new().eq("warehouseUnitId", marker_id.as_str()))
            .await
            .unwrap();
        if found.is_some() {
            landed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(landed);
    assert_eq!(mirror.row_count(UNITS_TABLE).await.unwrap(), 1);
    assert_eq!(primary.row_count(UNITS_TABLE).await.unwrap(), 1);
    assert_eq!(units.mirror_failures(), 0);
}

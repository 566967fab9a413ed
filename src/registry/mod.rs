//! Organization identity and the data-layer store chain behind it.
//!
//! Each organization owns three linked stores on the data layer:
//! the organization store (`registryId`, `name`, `icon`), the registry
//! store (`<dataVersion>` -> version store id) and the version store.
//! Locally only the identifiers needed to re-enter the chain are kept.

pub mod organization;
pub mod peers;
pub mod service;

pub use organization::{Organization, OrganizationSummary, OrganizationView};
pub use peers::{
    DefaultOrganization, DefaultOrganizationSource, HttpDefaultOrganizations,
    StaticDefaultOrganizations,
};
pub use service::OrganizationRegistry;

use crate::storage::{ORGANIZATIONS_TABLE, TableSchema};

pub const ORG_UID: &str = "orgUid";
pub const NAME: &str = "name";
pub const ICON: &str = "icon";
pub const REGISTRY_ID: &str = "registryId";
pub const IS_HOME: &str = "isHome";
pub const SUBSCRIBED: &str = "subscribed";

/// Data version written into a new registry store and read on import.
pub const DEFAULT_DATA_VERSION: &str = "v1";

/// `orgUid` is the key; at most one row may carry `isHome = true`.
pub fn organizations_schema() -> TableSchema {
    TableSchema::new(ORGANIZATIONS_TABLE)
        .primary_key(ORG_UID)
        .unique_when(IS_HOME, true)
}

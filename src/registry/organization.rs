use super::{ICON, IS_HOME, NAME, ORG_UID, REGISTRY_ID, SUBSCRIBED};
use crate::core::{Record, RegistryError, Result};
use serde::{Deserialize, Serialize};

/// A locally known organization, home or imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub org_uid: String,
    pub name: Option<String>,
    pub icon: Option<String>,
    /// Version store of the organization's registry.
    pub registry_id: Option<String>,
    pub is_home: bool,
    pub subscribed: bool,
}

impl Organization {
    pub fn to_record(&self) -> Record {
        Record::new()
            .with(ORG_UID, self.org_uid.as_str())
            .with(NAME, self.name.clone())
            .with(ICON, self.icon.clone())
            .with(REGISTRY_ID, self.registry_id.clone())
            .with(IS_HOME, self.is_home)
            .with(SUBSCRIBED, self.subscribed)
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let org_uid = record
            .get_str(ORG_UID)
            .ok_or_else(|| RegistryError::Storage("organization row without orgUid".to_string()))?;
        let text = |column: &str| record.get_str(column).map(str::to_string);
        Ok(Self {
            org_uid: org_uid.to_string(),
            name: text(NAME),
            icon: text(ICON),
            registry_id: text(REGISTRY_ID),
            is_home: record.get_bool(IS_HOME),
            subscribed: record.get_bool(SUBSCRIBED),
        })
    }

    pub fn summary(&self) -> OrganizationSummary {
        OrganizationSummary {
            org_uid: self.org_uid.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
        }
    }

    pub fn view(&self) -> OrganizationView {
        OrganizationView {
            org_uid: self.org_uid.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            is_home: self.is_home,
            subscribed: self.subscribed,
        }
    }
}

/// Public projection of the home organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSummary {
    pub org_uid: String,
    pub name: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationView {
    pub org_uid: String,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub is_home: bool,
    pub subscribed: bool,
}

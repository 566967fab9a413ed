//! Data-layer change lists for staged unit records.

use super::{DERIVED_FIELDS, PRIMARY_KEY};
use crate::core::{RegistryError, Result};
use crate::datalayer::DataLayerChange;
use serde_json::{Map, Value as Json};

const VINTAGE: &str = "vintage";
const QUALIFICATIONS: &str = "qualifications";

/// What a staged record asks the data layer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedAction {
    Insert,
    Update,
    Delete,
}

fn changes_for(action: StagedAction, key: &str, value: &Json) -> Result<Vec<DataLayerChange>> {
    let encoded = serde_json::to_string(value)?;
    Ok(match action {
        StagedAction::Insert => vec![DataLayerChange::insert(key, &encoded)],
        StagedAction::Update => vec![
            DataLayerChange::delete(key),
            DataLayerChange::insert(key, &encoded),
        ],
        StagedAction::Delete => vec![DataLayerChange::delete(key)],
    })
}

fn child_key(table: &str, child: &Map<String, Json>, fallback: &str) -> String {
    let id = match child.get("id") {
        Some(Json::String(id)) => id.clone(),
        Some(Json::Number(id)) => id.to_string(),
        _ => fallback.to_string(),
    };
    format!("{}|{}", table, id)
}

/// Builds the change list publishing one staged unit and its associations.
///
/// The unit entry omits the nested `vintage` and `qualifications` objects
/// (copying `vintage.id` into `vintageId`); each association gets entries
/// of its own.
pub fn generate_unit_change_list(
    action: StagedAction,
    warehouse_unit_id: &str,
    staged: &Json,
) -> Result<Vec<DataLayerChange>> {
    let record = staged.as_object().ok_or_else(|| {
        RegistryError::Serialization("staged unit must be a JSON object".to_string())
    })?;

    let mut unit = record.clone();
    let vintage = unit.remove(VINTAGE);
    let qualifications = unit.remove(QUALIFICATIONS);
    for field in DERIVED_FIELDS {
        unit.remove(field);
    }
    if let Some(id) = vintage.as_ref().and_then(|v| v.get("id")) {
        unit.insert("vintageId".to_string(), id.clone());
    }
    unit.insert(
        PRIMARY_KEY.to_string(),
        Json::String(warehouse_unit_id.to_string()),
    );

    let mut changes = changes_for(
        action,
        &format!("unit|{}", warehouse_unit_id),
        &Json::Object(unit),
    )?;

    if let Some(Json::Object(vintage)) = &vintage {
        let key = child_key(VINTAGE, vintage, warehouse_unit_id);
        changes.extend(changes_for(action, &key, &Json::Object(vintage.clone()))?);
    }

    if let Some(Json::Array(items)) = &qualifications {
        for item in items {
            let Json::Object(qualification) = item else {
                return Err(RegistryError::Serialization(
                    "qualification entries must be JSON objects".to_string(),
                ));
            };
            let key = child_key("qualification", qualification, warehouse_unit_id);
            changes.extend(changes_for(action, &key, item)?);
        }
    }

    Ok(changes)
}

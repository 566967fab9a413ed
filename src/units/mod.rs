//! Registry units: column catalogue, derived serial-block fields, mirrored
//! writes and staged change lists.

pub mod change_list;
pub mod store;

pub use change_list::{StagedAction, generate_unit_change_list};
pub use store::UnitStore;

use crate::core::{Record, Value};
use crate::storage::{TableSchema, UNITS_TABLE};
use lazy_static::lazy_static;
use regex::Regex;

pub const ENTITY_TYPE: &str = "units";
pub const PRIMARY_KEY: &str = "warehouseUnitId";
pub const OWNER_COLUMN: &str = "orgUid";
pub const SERIAL_NUMBER_BLOCK: &str = "serialNumberBlock";

pub const UNIT_BLOCK_START: &str = "unitBlockStart";
pub const UNIT_BLOCK_END: &str = "unitBlockEnd";
pub const UNIT_COUNT: &str = "unitCount";

/// Computed from `serialNumberBlock` on read; never stored or indexed.
pub const DERIVED_FIELDS: [&str; 3] = [UNIT_BLOCK_START, UNIT_BLOCK_END, UNIT_COUNT];

/// Maintained by the storage engine.
pub const TIMESTAMP_FIELDS: [&str; 2] = ["createdAt", "updatedAt"];

/// Free-text columns covered by the full-text index.
pub const FULL_TEXT_COLUMNS: [&str; 19] = [
    "unitOwnerOrgUid",
    "countryJurisdictionOfOwner",
    "inCountryJurisdictionOfOwner",
    "serialNumberBlock",
    "unitIdentifier",
    "unitType",
    "intendedBuyerOrgUid",
    "marketplace",
    "tags",
    "unitStatus",
    "unitTransactionType",
    "unitStatusReason",
    "tokenIssuanceHash",
    "marketplaceIdentifier",
    "unitsIssuanceLocation",
    "unitRegistryLink",
    "unitMarketplaceLink",
    "correspondingAdjustmentDeclaration",
    "correspondingAdjustmentStatus",
];

/// Stored columns: keys and foreign keys, then the free-text columns.
pub const PERSISTED_COLUMNS: [&str; 22] = [
    "warehouseUnitId",
    "orgUid",
    "vintageId",
    "unitOwnerOrgUid",
    "countryJurisdictionOfOwner",
    "inCountryJurisdictionOfOwner",
    "serialNumberBlock",
    "unitIdentifier",
    "unitType",
    "intendedBuyerOrgUid",
    "marketplace",
    "tags",
    "unitStatus",
    "unitTransactionType",
    "unitStatusReason",
    "tokenIssuanceHash",
    "marketplaceIdentifier",
    "unitsIssuanceLocation",
    "unitRegistryLink",
    "unitMarketplaceLink",
    "correspondingAdjustmentDeclaration",
    "correspondingAdjustmentStatus",
];

pub fn units_schema() -> TableSchema {
    TableSchema::new(UNITS_TABLE).primary_key(PRIMARY_KEY)
}

pub fn is_derived(column: &str) -> bool {
    DERIVED_FIELDS.contains(&column)
}

/// Any column a caller may name: stored, derived or timestamp.
pub fn is_known_column(column: &str) -> bool {
    PERSISTED_COLUMNS.contains(&column) || is_derived(column) || TIMESTAMP_FIELDS.contains(&column)
}

lazy_static! {
    static ref DIGITS: Regex = Regex::new(r"\d+").expect("digit pattern is valid");
}

/// Numeric bounds of a `"<prefix><start>-<prefix><end>"` serial block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialBlock {
    pub start: i64,
    pub end: i64,
}

impl SerialBlock {
    pub fn parse(raw: &str) -> Option<Self> {
        let (left, right) = raw.split_once('-')?;
        if right.contains('-') {
            return None;
        }
        let first_number = |half: &str| DIGITS.find(half)?.as_str().parse::<i64>().ok();
        Some(Self {
            start: first_number(left)?,
            end: first_number(right)?,
        })
    }

    pub fn count(&self) -> i64 {
        self.end - self.start
    }
}

/// Sets the derived block fields from `serialNumberBlock`, or removes them
/// when the block is absent or malformed.
pub fn derive_block_fields(record: &mut Record) {
    let block = record.get_str(SERIAL_NUMBER_BLOCK).and_then(SerialBlock::parse);
    match block {
        Some(block) => {
            record.set(UNIT_BLOCK_START, Value::Integer(block.start));
            record.set(UNIT_BLOCK_END, Value::Integer(block.end));
            record.set(UNIT_COUNT, Value::Integer(block.count()));
        }
        None => {
            for field in DERIVED_FIELDS {
                record.remove(field);
            }
        }
    }
}

/// Drops the fields that must never reach a persisted write.
pub fn strip_non_persisted(record: &mut Record) {
    for field in DERIVED_FIELDS {
        record.remove(field);
    }
}

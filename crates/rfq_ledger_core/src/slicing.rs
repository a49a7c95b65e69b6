use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CatalogSlice, Manufacturer, ManufacturerSummary, SliceDimension};

/// Identity of one published catalog slice. Variant order and field order
/// drive the derived `Ord`, which fixes the order slices are rebuilt in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "dimension", rename_all = "snake_case")]
pub enum SliceKey {
    Category { category: String },
    CategoryState { category: String, state: String },
}

impl SliceKey {
    pub fn category(category: impl Into<String>) -> Self {
        Self::Category {
            category: category.into(),
        }
    }

    pub fn category_state(category: impl Into<String>, state: impl Into<String>) -> Self {
        Self::CategoryState {
            category: category.into(),
            state: state.into(),
        }
    }

    pub fn dimension(&self) -> SliceDimension {
        match self {
            Self::Category { .. } => SliceDimension::Category,
            Self::CategoryState { .. } => SliceDimension::CategoryState,
        }
    }

    /// Path-like label used in API responses and logs: `cnc` or `cnc/CA`.
    pub fn label(&self) -> String {
        match self {
            Self::Category { category } => category.clone(),
            Self::CategoryState { category, state } => format!("{category}/{state}"),
        }
    }

    pub fn contains(&self, manufacturer: &Manufacturer) -> bool {
        match self {
            Self::Category { category } => manufacturer.categories.contains(category),
            Self::CategoryState { category, state } => {
                manufacturer.categories.contains(category)
                    && manufacturer.state() == Some(state.as_str())
            }
        }
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Category { category } => write!(f, "category:{category}"),
            Self::CategoryState { category, state } => {
                write!(f, "category_state:{category}/{state}")
            }
        }
    }
}

/// Every slice the manufacturer belongs to given its current record.
pub fn slice_keys_for(manufacturer: &Manufacturer) -> BTreeSet<SliceKey> {
    let mut keys = BTreeSet::new();
    for category in &manufacturer.categories {
        keys.insert(SliceKey::category(category.clone()));
        if let Some(state) = manufacturer.state() {
            keys.insert(SliceKey::category_state(category.clone(), state));
        }
    }
    keys
}

/// Slices touched by a change: where the manufacturer is now plus where it
/// was last published. Either side may be empty (new or deleted manufacturer).
pub fn affected_slice_keys(
    current: Option<&Manufacturer>,
    previous: &BTreeSet<SliceKey>,
) -> BTreeSet<SliceKey> {
    let mut keys = previous.clone();
    if let Some(manufacturer) = current {
        keys.extend(slice_keys_for(manufacturer));
    }
    keys
}

/// Recomputes a slice from the full manufacturer set. Members are ordered by
/// id and `generated_at` comes from member data, so the same membership
/// always produces the same value.
pub fn build_slice(key: &SliceKey, manufacturers: &[Manufacturer]) -> CatalogSlice {
    let mut members: Vec<&Manufacturer> = manufacturers
        .iter()
        .filter(|manufacturer| key.contains(manufacturer))
        .collect();
    members.sort_by(|left, right| left.id.cmp(&right.id));
    members.dedup_by(|left, right| left.id == right.id);

    let generated_at = members
        .iter()
        .map(|manufacturer| manufacturer.updated_at)
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    CatalogSlice {
        dimension: key.dimension(),
        key: key.label(),
        generated_at,
        items: members.into_iter().map(ManufacturerSummary::from).collect(),
    }
}

pub fn encode_slice(slice: &CatalogSlice) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(slice)
}

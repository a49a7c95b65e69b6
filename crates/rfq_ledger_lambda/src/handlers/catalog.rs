//! Manufacturer records and the catalog slices derived from them.
//!
//! A rebuild recomputes only the slices touched by the changed manufacturers:
//! the slices each one belongs to now plus the slices recorded in its
//! membership record from the previous publish. Slices are written
//! unconditionally; the membership record is written last so a failed rebuild
//! is retried against the same set of slices.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::adapters::clock::Clock;
use crate::adapters::object_store::{
    get_optional, list_all_keys, read_json, write_json, ObjectStore, Precondition,
};
use crate::runtime::contract::{
    normalize_manufacturer, ManufacturerWriteResponse, UpsertManufacturerRequest,
};
use crate::runtime::error::{LedgerError, LedgerResult};
use crate::runtime::ids::is_valid_manufacturer_id;
use crate::runtime::model::{Manufacturer, SliceMembership};
use crate::runtime::slicing::{
    affected_slice_keys, build_slice, encode_slice, slice_keys_for, SliceKey,
};
use crate::runtime::storage_keys::{
    manufacturer_object_key, manufacturers_prefix, membership_object_key, slice_object_key,
};

pub struct CatalogPublisher<'a> {
    store: &'a dyn ObjectStore,
    clock: &'a dyn Clock,
    prefix: &'a str,
}

impl<'a> CatalogPublisher<'a> {
    pub fn new(store: &'a dyn ObjectStore, clock: &'a dyn Clock, prefix: &'a str) -> Self {
        Self {
            store,
            clock,
            prefix,
        }
    }

    pub fn get_manufacturer(&self, manufacturer_id: &str) -> LedgerResult<Option<Manufacturer>> {
        if !is_valid_manufacturer_id(manufacturer_id) {
            return Ok(None);
        }
        let key = manufacturer_object_key(self.prefix, manufacturer_id);
        Ok(read_json::<Manufacturer>(self.store, &key)?.map(|versioned| versioned.value))
    }

    pub fn put_manufacturer(
        &self,
        request: UpsertManufacturerRequest,
    ) -> LedgerResult<ManufacturerWriteResponse> {
        let manufacturer = normalize_manufacturer(request, self.clock.now())?;
        write_json(
            self.store,
            &manufacturer_object_key(self.prefix, &manufacturer.id),
            &manufacturer,
            &Precondition::None,
        )?;
        info!(
            manufacturer_id = %manufacturer.id,
            categories = manufacturer.categories.len(),
            "manufacturer written"
        );

        let rebuilt = self.rebuild(std::slice::from_ref(&manufacturer.id))?;
        Ok(ManufacturerWriteResponse {
            id: manufacturer.id,
            rebuilt_slices: rebuilt.iter().map(SliceKey::label).collect(),
        })
    }

    pub fn delete_manufacturer(
        &self,
        manufacturer_id: &str,
    ) -> LedgerResult<ManufacturerWriteResponse> {
        let record_key = manufacturer_object_key(self.prefix, manufacturer_id);
        let has_record = is_valid_manufacturer_id(manufacturer_id)
            && get_optional(self.store, &record_key)?.is_some();
        let membership_key = membership_object_key(self.prefix, manufacturer_id);
        let has_membership = is_valid_manufacturer_id(manufacturer_id)
            && get_optional(self.store, &membership_key)?.is_some();
        if !has_record && !has_membership {
            return Err(LedgerError::NotFound(format!("manufacturer {manufacturer_id}")));
        }

        self.store.delete(&record_key)?;
        info!(manufacturer_id, "manufacturer deleted");

        let rebuilt = self.rebuild(&[manufacturer_id.to_string()])?;
        Ok(ManufacturerWriteResponse {
            id: manufacturer_id.to_string(),
            rebuilt_slices: rebuilt.iter().map(SliceKey::label).collect(),
        })
    }

    /// Rebuilds every slice affected by the given manufacturers and returns
    /// the slice keys written, in key order.
    pub fn rebuild(&self, changed_manufacturer_ids: &[String]) -> LedgerResult<Vec<SliceKey>> {
        let changed: BTreeSet<&str> = changed_manufacturer_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| is_valid_manufacturer_id(id))
            .collect();
        if changed.is_empty() {
            return Ok(Vec::new());
        }

        let manufacturers = self.load_manufacturers()?;
        let by_id: BTreeMap<&str, &Manufacturer> = manufacturers
            .iter()
            .map(|manufacturer| (manufacturer.id.as_str(), manufacturer))
            .collect();

        let mut affected = BTreeSet::new();
        for id in &changed {
            let previous = self.read_membership(id)?;
            affected.extend(affected_slice_keys(by_id.get(id).copied(), &previous));
        }

        for key in &affected {
            let slice = build_slice(key, &manufacturers);
            let body = encode_slice(&slice)?;
            let object_key = slice_object_key(self.prefix, key);
            self.store.put(&object_key, &body, &Precondition::None)?;
            info!(slice_key = %key, members = slice.items.len(), "catalog slice published");
        }

        for id in &changed {
            let membership_key = membership_object_key(self.prefix, id);
            match by_id.get(id) {
                Some(manufacturer) => {
                    let membership = SliceMembership {
                        manufacturer_id: (*id).to_string(),
                        slices: slice_keys_for(manufacturer),
                    };
                    write_json(self.store, &membership_key, &membership, &Precondition::None)?;
                }
                None => self.store.delete(&membership_key)?,
            }
        }

        Ok(affected.into_iter().collect())
    }

    /// One full scan of the manufacturer prefix. Undecodable records are
    /// skipped so one bad object cannot block publishing.
    fn load_manufacturers(&self) -> LedgerResult<Vec<Manufacturer>> {
        let keys = list_all_keys(self.store, &manufacturers_prefix(self.prefix))?;
        let mut manufacturers = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(object) = get_optional(self.store, &key)? else {
                continue;
            };
            match serde_json::from_slice::<Manufacturer>(&object.body) {
                Ok(manufacturer) => manufacturers.push(manufacturer),
                Err(error) => warn!(
                    manufacturer_key = %key,
                    error = %error,
                    "skipping undecodable manufacturer"
                ),
            }
        }
        manufacturers.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(manufacturers)
    }

    fn read_membership(&self, manufacturer_id: &str) -> LedgerResult<BTreeSet<SliceKey>> {
        let key = membership_object_key(self.prefix, manufacturer_id);
        match read_json::<SliceMembership>(self.store, &key) {
            Ok(membership) => Ok(membership
                .map(|versioned| versioned.value.slices)
                .unwrap_or_default()),
            Err(LedgerError::Internal(message)) => {
                warn!(manufacturer_id, error = %message, "ignoring unreadable membership record");
                Ok(BTreeSet::new())
            }
            Err(error) => Err(error),
        }
    }
}

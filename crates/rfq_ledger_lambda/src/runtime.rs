//! The domain crate, re-exported so handlers and binaries reach contracts,
//! records and key layout through one module boundary.

pub use rfq_ledger_core::{
    contract, error, ids, model, pagination, projection, slicing, storage_keys,
};

//! RFQ ledger and catalog domain primitives.
//!
//! This crate owns the stored record shapes, request/response contracts,
//! key layout, poll-cursor pagination and slice derivation. It excludes AWS
//! SDK and Lambda runtime concerns.

pub mod contract;
pub mod error;
pub mod ids;
pub mod model;
pub mod pagination;
pub mod projection;
pub mod slicing;
pub mod storage_keys;

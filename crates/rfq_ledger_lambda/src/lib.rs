//! AWS-oriented adapters and handlers for the RFQ ledger and catalog publisher.
//!
//! This crate owns runtime integration details (Lambda handlers, S3 and SQS
//! adapters, retry policy, configuration) and exposes the domain crate through
//! a single `runtime` module boundary.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod logging;
pub mod runtime;

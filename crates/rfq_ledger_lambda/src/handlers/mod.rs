pub mod api;
pub mod catalog;
pub mod idempotency;
pub mod ledger;
pub mod publisher;
pub mod workflows;

pub mod aws;
pub mod clock;
pub mod memory_store;
pub mod notifier;
pub mod object_store;
pub mod quota;
pub mod retry;
pub mod s3_store;

pub mod auth;
pub mod db;
pub mod errors;
pub mod idempotency;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod query;
pub mod registry;
pub mod rest;
pub mod validate;

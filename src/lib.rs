//! APIM service broker: library crate for the binary and integration tests.
//!
//! Re-exports the modules needed by integration tests in `tests/`.

pub mod api;
pub mod apim;
pub mod client;
pub mod config;
pub mod errors;
pub mod hash;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod token;

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! billsync shared types
//!
//! Domain types used by the billing core, the API server and the worker,
//! plus Postgres pool creation and the embedded schema migrations.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{CanonicalSnapshot, ParseEnumError, SubscriptionStatus, Tier};

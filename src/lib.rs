//! Laundry Repair Library
//!
//! Schema repair for the laundry shop database: converts the `customers`,
//! `orders` and `payments` primary keys from UUIDs to formatted identifiers
//! (`CUST-0000001`, `ORD-0000001`, `TRX-0000000001`) with every foreign key
//! kept intact, and backfills NULLs left behind by schema drift.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod backfill;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod repair;
pub mod report;
pub mod schema;

pub use backfill::{BackfillOptions, BackfillReport, NullBackfill};
pub use config::{load_config, AppConfig};
pub use db::{with_session, Session};
pub use errors::RepairError;
pub use repair::orphans::OrphanPolicy;
pub use repair::rollback::{rollback_identifiers, RollbackOptions};
pub use repair::{IdentifierMigration, MigrationOptions};

//! Persistence layer: libSQL-backed processed ledger.

pub mod ledger;
pub mod migrations;

pub use ledger::{LibSqlLedger, ProcessedLedger};

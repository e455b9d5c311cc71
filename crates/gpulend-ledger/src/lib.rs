//! GPULend Ledger: durable record of job outcomes.
//!
//! Layer 0 of the GPULend workspace. Every other crate depends on the
//! identifiers defined here and on the [`Ledger`] trait for accounting and
//! trust scoring.
//!
//! ## Key Components
//!
//! - `LedgerEntry`: terminal outcome of one job, written exactly once
//! - `OpenExecution`: executor-side mark used to find orphaned sandboxes
//! - `Ledger`: async, backend-agnostic storage trait
//! - `MemoryLedger` / `SurrealLedger`: in-process and SurrealDB backends

mod error;
mod ids;
mod memory;
mod migrations;
mod schema;
pub mod entry;
pub mod ledger;
pub mod surreal_ledger;
pub mod trust;

pub use entry::{
    ErrorClass, ExecutionRecord, LedgerEntry, LedgerSummary, OpenExecution, Outcome,
    ResourceUsage,
};
pub use error::{LedgerError, LedgerResult};
pub use ids::{JobId, PeerId};
pub use ledger::Ledger;
pub use memory::MemoryLedger;
pub use surreal_ledger::SurrealLedger;

//! SurrealDB schema initialization
//!
//! Safe to call on every connection (DEFINE statements are idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::LedgerResult;

/// Initialize all GPULend ledger tables.
pub async fn init_schema(db: &Surreal<Any>) -> LedgerResult<()> {
    info!("Initializing GPULend ledger schema");
    init_entries_table(db).await?;
    init_executions_table(db).await?;
    Ok(())
}

/// Initialize `ledger_entries`
///
/// Schema:
/// ```text
/// TABLE ledger_entries {
///   job_id:       STRING (unique)
///   requester:    STRING
///   executor:     STRING (indexed)
///   outcome:      STRING (succeeded | failed | timed_out | declined | peer_lost | cancelled)
///   error_class:  STRING?
///   reason:       STRING?
///   output_ref:   STRING?
///   peak_vram_mb, peak_memory_mb, cpu_time_ms, duration_ms: INT
///   recorded_at:  DATETIME (indexed)
/// }
/// ```
///
/// Rows are never updated or deleted.
async fn init_entries_table(db: &Surreal<Any>) -> LedgerResult<()> {
    debug!("Initializing ledger_entries table");

    let sql = r#"
        DEFINE TABLE ledger_entries AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_entry_job_id ON TABLE ledger_entries COLUMNS job_id UNIQUE;
        DEFINE INDEX idx_entry_executor ON TABLE ledger_entries COLUMNS executor;
        DEFINE INDEX idx_entry_recorded_at ON TABLE ledger_entries COLUMNS recorded_at;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// Initialize `executions`
///
/// One row per accepted job on this node; `outcome`/`closed_at` are set once.
async fn init_executions_table(db: &Surreal<Any>) -> LedgerResult<()> {
    debug!("Initializing executions table");

    let sql = r#"
        DEFINE TABLE executions AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_execution_job_id ON TABLE executions COLUMNS job_id UNIQUE;
    "#;

    db.query(sql).await?;
    Ok(())
}

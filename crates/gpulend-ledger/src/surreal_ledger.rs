//! SurrealDB-backed Ledger implementation
//!
//! Uses `schema::EntryRow` and `schema::ExecutionRow` for persistence,
//! converting to/from domain types at the boundary.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use crate::entry::{LedgerEntry, OpenExecution, Outcome};
use crate::error::{LedgerError, LedgerResult};
use crate::ids::{JobId, PeerId};
use crate::ledger::Ledger;
use crate::migrations;
use crate::schema::{EntryRow, ExecutionRow};

const NAMESPACE: &str = "gpulend";
const DATABASE: &str = "ledger";

/// SurrealDB-backed implementation of [`Ledger`].
pub struct SurrealLedger {
    db: Surreal<Any>,
}

impl SurrealLedger {
    /// Create an in-memory instance.
    ///
    /// Connects to `mem://`, selects `gpulend/ledger`, and runs `init_schema`.
    pub async fn in_memory() -> LedgerResult<Self> {
        let ledger = Self::connect("mem://").await?;
        info!("SurrealLedger connected (in-memory)");
        Ok(ledger)
    }

    /// Open (or create) an on-disk ledger at `path` using the SurrealKV engine.
    pub async fn open(path: &Path) -> LedgerResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            LedgerError::Connection(format!(
                "Failed to create ledger directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        let ledger = Self::connect(&url).await?;
        info!("SurrealLedger connected ({})", url);
        Ok(ledger)
    }

    async fn connect(url: &str) -> LedgerResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| LedgerError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_entry(&self, job_id: &str) -> LedgerResult<Option<EntryRow>> {
        let jid = job_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM ledger_entries WHERE job_id = $jid")
            .bind(("jid", jid))
            .await?;
        let rows: Vec<EntryRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_execution(&self, job_id: &str) -> LedgerResult<Option<ExecutionRow>> {
        let jid = job_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM executions WHERE job_id = $jid")
            .bind(("jid", jid))
            .await?;
        let rows: Vec<ExecutionRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    fn rows_to_entries(rows: Vec<EntryRow>) -> LedgerResult<Vec<LedgerEntry>> {
        rows.into_iter().map(EntryRow::into_entry).collect()
    }
}

#[async_trait]
impl Ledger for SurrealLedger {
    async fn record(&self, entry: LedgerEntry) -> LedgerResult<()> {
        let job_id = entry.job_id.clone();
        if self.fetch_entry(job_id.as_str()).await?.is_some() {
            return Err(LedgerError::DuplicateEntry { job_id });
        }

        debug!(job_id = %job_id, outcome = %entry.outcome, "recording ledger entry");

        let created: Result<Option<EntryRow>, surrealdb::Error> = self
            .db
            .create("ledger_entries")
            .content(EntryRow::from(entry))
            .await;

        if let Err(e) = created {
            // The unique index lost a race against a concurrent writer.
            if self.fetch_entry(job_id.as_str()).await?.is_some() {
                warn!(job_id = %job_id, error = %e, "duplicate ledger write rejected by index");
                return Err(LedgerError::DuplicateEntry { job_id });
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> LedgerResult<Option<LedgerEntry>> {
        self.fetch_entry(job_id.as_str())
            .await?
            .map(EntryRow::into_entry)
            .transpose()
    }

    async fn entries(&self, limit: usize) -> LedgerResult<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = if limit == usize::MAX {
            let mut res = self
                .db
                .query("SELECT * FROM ledger_entries ORDER BY recorded_at DESC")
                .await?;
            res.take(0)?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM ledger_entries ORDER BY recorded_at DESC LIMIT $limit")
                .bind(("limit", limit as i64))
                .await?;
            res.take(0)?
        };
        Self::rows_to_entries(rows)
    }

    async fn entries_for_executor(
        &self,
        peer: &PeerId,
        limit: usize,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let executor = peer.as_str().to_string();
        let mut res = self
            .db
            .query(
                "SELECT * FROM ledger_entries WHERE executor = $executor \
                 ORDER BY recorded_at DESC LIMIT $limit",
            )
            .bind(("executor", executor))
            .bind(("limit", limit.min(i64::MAX as usize) as i64))
            .await?;
        let rows: Vec<EntryRow> = res.take(0)?;
        Self::rows_to_entries(rows)
    }

    async fn open_execution(&self, execution: OpenExecution) -> LedgerResult<()> {
        let job_id = execution.job_id.clone();
        if self.fetch_execution(job_id.as_str()).await?.is_some() {
            return Err(LedgerError::DuplicateExecution { job_id });
        }
        let _created: Option<ExecutionRow> = self
            .db
            .create("executions")
            .content(ExecutionRow::from(execution))
            .await?;
        Ok(())
    }

    async fn close_execution(&self, job_id: &JobId, outcome: Outcome) -> LedgerResult<bool> {
        let Some(mut row) = self.fetch_execution(job_id.as_str()).await? else {
            return Ok(false);
        };
        if row.outcome.is_some() {
            return Ok(false);
        }

        row.id = None;
        row.outcome = Some(outcome.label().to_string());
        row.error_class = outcome.error_class().map(|c| c.as_str().to_string());
        row.closed_at = Some(Utc::now());

        let jid = job_id.as_str().to_string();
        self.db
            .query("UPDATE executions CONTENT $row WHERE job_id = $jid")
            .bind(("row", row))
            .bind(("jid", jid))
            .await?;
        Ok(true)
    }

    async fn open_executions(&self) -> LedgerResult<Vec<OpenExecution>> {
        let mut res = self
            .db
            .query("SELECT * FROM executions ORDER BY opened_at ASC")
            .await?;
        let rows: Vec<ExecutionRow> = res.take(0)?;
        let mut open = Vec::new();
        for row in rows {
            let record = row.into_record()?;
            if record.outcome.is_none() {
                open.push(record.execution);
            }
        }
        Ok(open)
    }
}

//! The `Ledger` storage trait.
//!
//! Guarantees:
//! - `record` writes at most one terminal entry per job ID; a second write
//!   fails with [`crate::LedgerError::DuplicateEntry`] instead of overwriting.
//! - Entries are never mutated after write.
//! - Execution marks transition open → closed exactly once.
//!
//! All methods are async and backend-agnostic. [`crate::MemoryLedger`] keeps
//! everything in process; [`crate::SurrealLedger`] persists to SurrealDB.

use async_trait::async_trait;

use crate::entry::{LedgerEntry, LedgerSummary, OpenExecution, Outcome};
use crate::error::LedgerResult;
use crate::ids::{JobId, PeerId};
use crate::trust;

/// Append-only job outcome ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append the terminal entry for a job. Rejects duplicates.
    async fn record(&self, entry: LedgerEntry) -> LedgerResult<()>;

    /// Terminal entry for a job, if recorded.
    async fn get(&self, job_id: &JobId) -> LedgerResult<Option<LedgerEntry>>;

    /// Most recent entries, newest first.
    async fn entries(&self, limit: usize) -> LedgerResult<Vec<LedgerEntry>>;

    /// Most recent entries where `peer` was the executor, newest first.
    async fn entries_for_executor(
        &self,
        peer: &PeerId,
        limit: usize,
    ) -> LedgerResult<Vec<LedgerEntry>>;

    /// Mark a job as executing on this node.
    async fn open_execution(&self, execution: OpenExecution) -> LedgerResult<()>;

    /// Close an execution mark. Returns `false` if it was unknown or already closed.
    async fn close_execution(&self, job_id: &JobId, outcome: Outcome) -> LedgerResult<bool>;

    /// Execution marks that were never closed.
    async fn open_executions(&self) -> LedgerResult<Vec<OpenExecution>>;

    /// Persist any buffered state. Called on node shutdown.
    async fn flush(&self) -> LedgerResult<()> {
        Ok(())
    }

    /// Rolling trust score of an executor in `[0, 1]`.
    async fn trust_score(&self, peer: &PeerId) -> LedgerResult<f64> {
        let recent = self
            .entries_for_executor(peer, trust::TRUST_WINDOW)
            .await?;
        Ok(trust::score(&recent))
    }

    /// Number of failing outcomes in the trust window.
    async fn recent_failures(&self, peer: &PeerId) -> LedgerResult<u32> {
        let recent = self
            .entries_for_executor(peer, trust::TRUST_WINDOW)
            .await?;
        Ok(trust::failures(&recent))
    }

    /// Outcome counts across the whole ledger.
    async fn summary(&self) -> LedgerResult<LedgerSummary> {
        let all = self.entries(usize::MAX).await?;
        Ok(LedgerSummary::tally(&all))
    }
}

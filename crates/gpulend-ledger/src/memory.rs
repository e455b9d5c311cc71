//! In-process ledger backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::entry::{ExecutionRecord, LedgerEntry, OpenExecution, Outcome};
use crate::error::{LedgerError, LedgerResult};
use crate::ids::{JobId, PeerId};
use crate::ledger::Ledger;

#[derive(Debug, Default)]
struct Inner {
    /// Append order is chronological.
    entries: Vec<LedgerEntry>,
    index: HashMap<JobId, usize>,
    executions: HashMap<JobId, ExecutionRecord>,
}

/// In-memory ledger. Used by tests and by nodes started without persistence.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every execution mark, open or closed.
    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        self.inner.lock().await.executions.values().cloned().collect()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record(&self, entry: LedgerEntry) -> LedgerResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.index.contains_key(&entry.job_id) {
            return Err(LedgerError::DuplicateEntry {
                job_id: entry.job_id,
            });
        }
        let pos = inner.entries.len();
        inner.index.insert(entry.job_id.clone(), pos);
        inner.entries.push(entry);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> LedgerResult<Option<LedgerEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .get(job_id)
            .and_then(|&pos| inner.entries.get(pos))
            .cloned())
    }

    async fn entries(&self, limit: usize) -> LedgerResult<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.iter().rev().take(limit).cloned().collect())
    }

    async fn entries_for_executor(
        &self,
        peer: &PeerId,
        limit: usize,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .rev()
            .filter(|e| &e.executor == peer)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn open_execution(&self, execution: OpenExecution) -> LedgerResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.executions.contains_key(&execution.job_id) {
            return Err(LedgerError::DuplicateExecution {
                job_id: execution.job_id,
            });
        }
        inner.executions.insert(
            execution.job_id.clone(),
            ExecutionRecord {
                execution,
                outcome: None,
                closed_at: None,
            },
        );
        Ok(())
    }

    async fn close_execution(&self, job_id: &JobId, outcome: Outcome) -> LedgerResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.executions.get_mut(job_id) {
            Some(record) if record.outcome.is_none() => {
                record.outcome = Some(outcome);
                record.closed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn open_executions(&self) -> LedgerResult<Vec<OpenExecution>> {
        let inner = self.inner.lock().await;
        let mut open: Vec<OpenExecution> = inner
            .executions
            .values()
            .filter(|r| r.outcome.is_none())
            .map(|r| r.execution.clone())
            .collect();
        open.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        Ok(open)
    }
}

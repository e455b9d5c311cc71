//! Row definitions for the GPULend SurrealDB tables
//!
//! Tables:
//! - ledger_entries: terminal job outcomes (unique per job_id)
//! - executions: executor-side open/closed marks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{ExecutionRecord, LedgerEntry, OpenExecution, Outcome, ResourceUsage};
use crate::error::{LedgerError, LedgerResult};
use crate::ids::{JobId, PeerId};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in `ledger_entries`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRow {
    /// SurrealDB record ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub job_id: String,
    pub requester: String,
    pub executor: String,
    pub outcome: String,
    pub error_class: Option<String>,
    pub reason: Option<String>,
    pub output_ref: Option<String>,
    pub peak_vram_mb: u64,
    pub peak_memory_mb: u64,
    pub cpu_time_ms: u64,
    pub duration_ms: u64,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl From<LedgerEntry> for EntryRow {
    fn from(e: LedgerEntry) -> Self {
        Self {
            id: None,
            job_id: e.job_id.0,
            requester: e.requester.0,
            executor: e.executor.0,
            outcome: e.outcome.label().to_string(),
            error_class: e.outcome.error_class().map(|c| c.as_str().to_string()),
            reason: e.reason,
            output_ref: e.output_ref,
            peak_vram_mb: e.consumed.peak_vram_mb,
            peak_memory_mb: e.consumed.peak_memory_mb,
            cpu_time_ms: e.consumed.cpu_time_ms,
            duration_ms: e.duration_ms,
            recorded_at: e.recorded_at,
        }
    }
}

impl EntryRow {
    pub fn into_entry(self) -> LedgerResult<LedgerEntry> {
        let outcome = Outcome::from_parts(&self.outcome, self.error_class.as_deref())
            .ok_or_else(|| {
                LedgerError::Corrupt(format!(
                    "job {}: unknown outcome {} / {:?}",
                    self.job_id, self.outcome, self.error_class
                ))
            })?;
        Ok(LedgerEntry {
            job_id: JobId(self.job_id),
            requester: PeerId(self.requester),
            executor: PeerId(self.executor),
            outcome,
            reason: self.reason,
            output_ref: self.output_ref,
            consumed: ResourceUsage {
                peak_vram_mb: self.peak_vram_mb,
                peak_memory_mb: self.peak_memory_mb,
                cpu_time_ms: self.cpu_time_ms,
            },
            duration_ms: self.duration_ms,
            recorded_at: self.recorded_at,
        })
    }
}

/// Row in `executions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub job_id: String,
    pub requester: String,
    pub executor: String,
    #[serde(with = "surreal_datetime")]
    pub opened_at: DateTime<Utc>,
    pub outcome: Option<String>,
    pub error_class: Option<String>,
    #[serde(with = "surreal_datetime_opt")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<OpenExecution> for ExecutionRow {
    fn from(o: OpenExecution) -> Self {
        Self {
            id: None,
            job_id: o.job_id.0,
            requester: o.requester.0,
            executor: o.executor.0,
            opened_at: o.opened_at,
            outcome: None,
            error_class: None,
            closed_at: None,
        }
    }
}

impl ExecutionRow {
    pub fn into_record(self) -> LedgerResult<ExecutionRecord> {
        let outcome = match &self.outcome {
            Some(label) => Some(
                Outcome::from_parts(label, self.error_class.as_deref()).ok_or_else(|| {
                    LedgerError::Corrupt(format!("execution {}: unknown outcome {label}", self.job_id))
                })?,
            ),
            None => None,
        };
        Ok(ExecutionRecord {
            execution: OpenExecution {
                job_id: JobId(self.job_id),
                requester: PeerId(self.requester),
                executor: PeerId(self.executor),
                opened_at: self.opened_at,
            },
            outcome,
            closed_at: self.closed_at,
        })
    }
}

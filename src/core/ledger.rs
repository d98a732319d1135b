//! Instance ledger: what actually happened for each occurrence.
//!
//! One row per (job, occurrence date), enforced by a unique key. Live
//! records are written by the driver as captures run; inferred records are
//! reconstructed from output files for past dates nobody recorded, and are
//! only ever inserted when no row exists yet.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::store::{parse_date, parse_timestamp, Store, DATE_FORMAT};
use crate::domain::{Instance, InstanceStatus, JobId, Outcome, Provenance};
use crate::error::StoreError;

const INSTANCE_COLUMNS: &str =
    "id, job_id, occurrence_date, status, started_at, completed_at, notes, provenance";

/// Output files an occurrence should have produced
#[derive(Debug, Clone)]
pub struct OutputEvidence {
    pub expected: Vec<PathBuf>,

    /// A file at or below this size counts as absent
    pub min_bytes: u64,
}

impl OutputEvidence {
    pub fn new(expected: Vec<PathBuf>, min_bytes: u64) -> Self {
        Self {
            expected,
            min_bytes,
        }
    }

    /// Infer a status and note from what is on disk
    pub fn infer(&self) -> (InstanceStatus, String) {
        let present = self
            .expected
            .iter()
            .filter(|path| {
                std::fs::metadata(path)
                    .map(|m| m.is_file() && m.len() > self.min_bytes)
                    .unwrap_or(false)
            })
            .count();

        if !self.expected.is_empty() && present == self.expected.len() {
            (
                InstanceStatus::Completed,
                "inferred from output files".to_string(),
            )
        } else if present > 0 {
            (
                InstanceStatus::Failed,
                format!("partial output ({} of {} files)", present, self.expected.len()),
            )
        } else {
            (InstanceStatus::Missed, "no output files found".to_string())
        }
    }
}

/// Durable per-occurrence status
#[derive(Clone)]
pub struct Ledger {
    store: Arc<Store>,
}

impl Ledger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get_instance(&self, job_id: JobId, date: NaiveDate) -> Result<Option<Instance>, StoreError> {
        let conn = self.store.lock()?;
        select_one(&conn, job_id, date)
    }

    /// Create a pending instance unless one exists, then return the row
    pub fn ensure_instance(&self, job_id: JobId, date: NaiveDate) -> Result<Instance, StoreError> {
        let conn = self.store.lock()?;
        let inserted = conn.execute(
            "INSERT INTO instances (job_id, occurrence_date, status, provenance)
             VALUES (?1, ?2, 'pending', 'live')
             ON CONFLICT(job_id, occurrence_date) DO NOTHING",
            params![job_id.to_string(), date.format(DATE_FORMAT).to_string()],
        )?;
        if inserted > 0 {
            debug!(job = %job_id, date = %date, "Created pending instance");
        }
        select_one(&conn, job_id, date)?.ok_or(StoreError::Corrupt {
            table: "instances",
            reason: format!("instance for {} on {} vanished after insert", job_id, date),
        })
    }

    /// Write a live outcome, replacing any earlier (possibly inferred) record.
    ///
    /// Timestamps and notes left as `None` keep their stored values.
    pub fn record_outcome(
        &self,
        job_id: JobId,
        date: NaiveDate,
        status: InstanceStatus,
        outcome: Outcome,
    ) -> Result<Instance, StoreError> {
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO instances
                (job_id, occurrence_date, status, started_at, completed_at, notes, provenance)
             VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, ''), 'live')
             ON CONFLICT(job_id, occurrence_date) DO UPDATE SET
                status = excluded.status,
                started_at = COALESCE(?4, instances.started_at),
                completed_at = COALESCE(?5, instances.completed_at),
                notes = COALESCE(?6, instances.notes),
                provenance = 'live'",
            params![
                job_id.to_string(),
                date.format(DATE_FORMAT).to_string(),
                status.as_str(),
                outcome.started_at.map(|t| t.to_rfc3339()),
                outcome.completed_at.map(|t| t.to_rfc3339()),
                outcome.notes,
            ],
        )?;
        info!(job = %job_id, date = %date, status = %status, "Recorded outcome");
        select_one(&conn, job_id, date)?.ok_or(StoreError::Corrupt {
            table: "instances",
            reason: format!("instance for {} on {} vanished after upsert", job_id, date),
        })
    }

    /// Infer an instance for a past occurrence nobody recorded.
    ///
    /// Existing rows are returned untouched, live or inferred.
    pub fn repair(
        &self,
        job_id: JobId,
        date: NaiveDate,
        evidence: &OutputEvidence,
    ) -> Result<Instance, StoreError> {
        if let Some(existing) = self.get_instance(job_id, date)? {
            return Ok(existing);
        }

        // File checks run outside the lock
        let (status, notes) = evidence.infer();

        let conn = self.store.lock()?;
        let inserted = conn.execute(
            "INSERT INTO instances (job_id, occurrence_date, status, notes, provenance)
             VALUES (?1, ?2, ?3, ?4, 'inferred')
             ON CONFLICT(job_id, occurrence_date) DO NOTHING",
            params![
                job_id.to_string(),
                date.format(DATE_FORMAT).to_string(),
                status.as_str(),
                notes,
            ],
        )?;
        if inserted > 0 {
            debug!(job = %job_id, date = %date, status = %status, "Inferred instance");
        }
        select_one(&conn, job_id, date)?.ok_or(StoreError::Corrupt {
            table: "instances",
            reason: format!("instance for {} on {} vanished after repair", job_id, date),
        })
    }

    pub fn instances_for_job(&self, job_id: JobId) -> Result<Vec<Instance>, StoreError> {
        let conn = self.store.lock()?;
        select_many(
            &conn,
            &format!(
                "SELECT {} FROM instances WHERE job_id = ?1 ORDER BY occurrence_date",
                INSTANCE_COLUMNS
            ),
            params![job_id.to_string()],
        )
    }

    /// Instances with `from <= occurrence_date <= to`
    pub fn instances_in_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Instance>, StoreError> {
        let conn = self.store.lock()?;
        select_many(
            &conn,
            &format!(
                "SELECT {} FROM instances WHERE occurrence_date >= ?1 AND occurrence_date <= ?2
                 ORDER BY occurrence_date, job_id",
                INSTANCE_COLUMNS
            ),
            params![
                from.format(DATE_FORMAT).to_string(),
                to.format(DATE_FORMAT).to_string()
            ],
        )
    }

    pub fn instances_with_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, StoreError> {
        let conn = self.store.lock()?;
        select_many(
            &conn,
            &format!(
                "SELECT {} FROM instances WHERE status = ?1 ORDER BY occurrence_date",
                INSTANCE_COLUMNS
            ),
            params![status.as_str()],
        )
    }
}

fn select_one(conn: &Connection, job_id: JobId, date: NaiveDate) -> Result<Option<Instance>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM instances WHERE job_id = ?1 AND occurrence_date = ?2",
                INSTANCE_COLUMNS
            ),
            params![job_id.to_string(), date.format(DATE_FORMAT).to_string()],
            InstanceRow::read,
        )
        .optional()?;
    row.map(InstanceRow::into_instance).transpose()
}

fn select_many(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Instance>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, InstanceRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(InstanceRow::into_instance).collect()
}

struct InstanceRow {
    id: i64,
    job_id: String,
    occurrence_date: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    notes: String,
    provenance: String,
}

impl InstanceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            occurrence_date: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            notes: row.get(6)?,
            provenance: row.get(7)?,
        })
    }

    fn into_instance(self) -> Result<Instance, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            table: "instances",
            reason,
        };

        Ok(Instance {
            id: self.id,
            job_id: uuid::Uuid::parse_str(&self.job_id)
                .map_err(|e| corrupt(format!("job_id {}: {}", self.job_id, e)))?,
            occurrence_date: parse_date(&self.occurrence_date).map_err(corrupt)?,
            status: self.status.parse().map_err(corrupt)?,
            started_at: self
                .started_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(corrupt)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(corrupt)?,
            notes: self.notes,
            provenance: self.provenance.parse().map_err(corrupt)?,
        })
    }
}

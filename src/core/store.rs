//! SQLite persistence for jobs, instances, templates and runtime settings.
//!
//! One connection behind a mutex; every statement runs under the lock, so
//! ledger writes are linearized. Dates are stored as ISO text
//! (`%Y-%m-%d`, `%Y-%m-%dT%H:%M:%S`, RFC 3339 for UTC stamps).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Job, JobId, JobStatus, RecurrencePattern, Template, TemplateDefinition};
use crate::error::StoreError;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const SCHEMA_VERSION: i64 = 2;

const CREATE_JOBS: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    start TEXT NOT NULL,
    duration_secs INTEGER NOT NULL,
    recurrence TEXT,
    capture_video INTEGER NOT NULL DEFAULT 0,
    allow_override INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
)";

const CREATE_INSTANCES: &str = "CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    occurrence_date TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    notes TEXT NOT NULL DEFAULT '',
    provenance TEXT NOT NULL DEFAULT 'live',
    UNIQUE(job_id, occurrence_date),
    CONSTRAINT job_id FOREIGN KEY (job_id) REFERENCES jobs (id) ON DELETE CASCADE
)";

const CREATE_SYSTEM_CONFIG: &str = "CREATE TABLE IF NOT EXISTS system_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

const CREATE_TEMPLATES: &str = "CREATE TABLE IF NOT EXISTS templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    duration_secs INTEGER NOT NULL,
    recurrence TEXT,
    capture_video INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS instances_date_index ON instances (occurrence_date)",
    "CREATE INDEX IF NOT EXISTS instances_status_index ON instances (status)",
];

pub(crate) const JOB_COLUMNS: &str =
    "id, name, start, duration_secs, recurrence, capture_video, allow_override, status, notes, created_at";

const TEMPLATE_COLUMNS: &str =
    "id, name, duration_secs, recurrence, capture_video, description, created_at, updated_at";

/// SQLite-backed store
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Corrupt {
                    table: "database",
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened database");
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.execute(CREATE_JOBS, [])?;
        conn.execute(CREATE_INSTANCES, [])?;
        conn.execute(CREATE_SYSTEM_CONFIG, [])?;
        conn.execute(CREATE_TEMPLATES, [])?;
        for index in INDICES {
            conn.execute(index, [])?;
        }

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
            info!(version = SCHEMA_VERSION, "Initialized database schema");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection for a sequence of statements
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let recurrence = encode_recurrence(&job.recurrence)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                JOB_COLUMNS
            ),
            params![
                job.id.to_string(),
                job.name,
                job.start.format(DATETIME_FORMAT).to_string(),
                job.duration_secs as i64,
                recurrence,
                job.capture_video,
                job.allow_override,
                job.status.as_str(),
                job.notes,
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Overwrite a job's editable fields and status
    pub fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let recurrence = encode_recurrence(&job.recurrence)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET name = ?2, start = ?3, duration_secs = ?4, recurrence = ?5,
                capture_video = ?6, allow_override = ?7, status = ?8, notes = ?9
             WHERE id = ?1",
            params![
                job.id.to_string(),
                job.name,
                job.start.format(DATETIME_FORMAT).to_string(),
                job.duration_secs as i64,
                recurrence,
                job.capture_video,
                job.allow_override,
                job.status.as_str(),
                job.notes,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    pub fn set_job_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    /// Delete a job; its instances go with it
    pub fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id.to_string()],
                JobRow::read,
            )
            .optional()?;
        match row {
            Some(row) => row.into_job(),
            None => Err(StoreError::JobNotFound(id)),
        }
    }

    /// All jobs, oldest first
    pub fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY created_at, name",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], JobRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    pub fn insert_template(&self, def: &TemplateDefinition) -> Result<Template, StoreError> {
        let recurrence = encode_recurrence(&def.recurrence)?;
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO templates ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                TEMPLATE_COLUMNS
            ),
            params![
                def.name,
                def.duration_secs as i64,
                recurrence,
                def.capture_video,
                def.description,
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| name_conflict(e, &def.name))?;
        let id = conn.last_insert_rowid();
        drop(conn);
        debug!(id, name = %def.name, "Inserted template");
        self.get_template(&def.name)
    }

    pub fn get_template(&self, name: &str) -> Result<Template, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM templates WHERE name = ?1", TEMPLATE_COLUMNS),
                params![name],
                TemplateRow::read,
            )
            .optional()?;
        match row {
            Some(row) => row.into_template(),
            None => Err(StoreError::TemplateNotFound(name.to_string())),
        }
    }

    /// All templates, by name
    pub fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM templates ORDER BY name",
            TEMPLATE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], TemplateRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TemplateRow::into_template).collect()
    }

    /// Replace the template called `name`; `def.name` may rename it
    pub fn update_template(
        &self,
        name: &str,
        def: &TemplateDefinition,
    ) -> Result<Template, StoreError> {
        let recurrence = encode_recurrence(&def.recurrence)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE templates SET name = ?2, duration_secs = ?3, recurrence = ?4,
                    capture_video = ?5, description = ?6, updated_at = ?7
                 WHERE name = ?1",
                params![
                    name,
                    def.name,
                    def.duration_secs as i64,
                    recurrence,
                    def.capture_video,
                    def.description,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| name_conflict(e, &def.name))?;
        drop(conn);
        if changed == 0 {
            return Err(StoreError::TemplateNotFound(name.to_string()));
        }
        self.get_template(&def.name)
    }

    pub fn delete_template(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM templates WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Err(StoreError::TemplateNotFound(name.to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // system_config
    // ------------------------------------------------------------------

    pub fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT value FROM system_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO system_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn unset_config(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM system_config WHERE key = ?1", params![key])? > 0)
    }

    pub fn list_config(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM system_config ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn encode_recurrence(recurrence: &Option<RecurrencePattern>) -> Result<Option<String>, StoreError> {
    recurrence
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn name_conflict(err: rusqlite::Error, name: &str) -> StoreError {
    let unique = matches!(
        &err,
        rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation
    );
    if unique {
        StoreError::DuplicateTemplate(name.to_string())
    } else {
        StoreError::Sqlite(err)
    }
}

/// Raw column values, converted outside the rusqlite callback
struct JobRow {
    id: String,
    name: String,
    start: String,
    duration_secs: i64,
    recurrence: Option<String>,
    capture_video: bool,
    allow_override: bool,
    status: String,
    notes: String,
    created_at: String,
}

impl JobRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            start: row.get(2)?,
            duration_secs: row.get(3)?,
            recurrence: row.get(4)?,
            capture_video: row.get(5)?,
            allow_override: row.get(6)?,
            status: row.get(7)?,
            notes: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            table: "jobs",
            reason,
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(format!("id {}: {}", self.id, e)))?;
        let recurrence = self
            .recurrence
            .as_deref()
            .map(serde_json::from_str::<RecurrencePattern>)
            .transpose()?;

        Ok(Job {
            id,
            name: self.name,
            start: parse_datetime(&self.start).map_err(corrupt)?,
            duration_secs: u64::try_from(self.duration_secs)
                .map_err(|_| corrupt(format!("negative duration {}", self.duration_secs)))?,
            recurrence,
            capture_video: self.capture_video,
            allow_override: self.allow_override,
            status: self.status.parse().map_err(corrupt)?,
            notes: self.notes,
            created_at: parse_timestamp(&self.created_at).map_err(corrupt)?,
        })
    }
}

struct TemplateRow {
    id: i64,
    name: String,
    duration_secs: i64,
    recurrence: Option<String>,
    capture_video: bool,
    description: String,
    created_at: String,
    updated_at: String,
}

impl TemplateRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            duration_secs: row.get(2)?,
            recurrence: row.get(3)?,
            capture_video: row.get(4)?,
            description: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_template(self) -> Result<Template, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            table: "templates",
            reason,
        };
        let recurrence = self
            .recurrence
            .as_deref()
            .map(serde_json::from_str::<RecurrencePattern>)
            .transpose()?;

        Ok(Template {
            id: self.id,
            duration_secs: u64::try_from(self.duration_secs)
                .map_err(|_| corrupt(format!("negative duration {}", self.duration_secs)))?,
            name: self.name,
            recurrence,
            capture_video: self.capture_video,
            description: self.description,
            created_at: parse_timestamp(&self.created_at).map_err(corrupt)?,
            updated_at: parse_timestamp(&self.updated_at).map_err(corrupt)?,
        })
    }
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|e| format!("date {}: {}", value, e))
}

pub(crate) fn parse_datetime(value: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
        .map_err(|e| format!("datetime {}: {}", value, e))
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("timestamp {}: {}", value, e))
}

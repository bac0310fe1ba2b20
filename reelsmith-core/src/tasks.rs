use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;

use crate::sqlite::configure_connection;

const TASKS_SCHEMA: &str = include_str!("../../sql/tasks.sql");

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to open task database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on task database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("task database path not configured")]
    MissingStore,
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("task record not found: {0}")]
    NotFound(i64),
}

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            _ => Err(TaskError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl TaskPriority {
    pub fn value(self) -> i64 {
        self as i64
    }

    fn from_value(value: i64) -> Self {
        match value {
            0 => TaskPriority::Low,
            2 => TaskPriority::High,
            _ => TaskPriority::Normal,
        }
    }
}

/// Lower runs first: older tasks, and higher priorities by 10000 seconds per step.
pub fn processing_order(created_at: DateTime<Utc>, priority: TaskPriority) -> f64 {
    created_at.timestamp_millis() as f64 / 1000.0 - priority.value() as f64 * 10_000.0
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub workflow_name: String,
    pub channel_name: String,
    pub prefix: String,
    pub file_path: PathBuf,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub workflow_name: String,
    pub channel_name: String,
    pub prefix: String,
    pub file_path: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub processing_order: Option<f64>,
    pub workflow_task_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            workflow_name: row.get("workflow_name")?,
            channel_name: row.get("channel_name")?,
            prefix: row.get("prefix")?,
            file_path: row.get("file_path")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(TaskStatus::Pending),
            priority: TaskPriority::from_value(row.get("priority")?),
            processing_order: row.get("processing_order")?,
            workflow_task_id: row.get("workflow_task_id")?,
            error_message: row.get("error_message")?,
            created_at: parse_timestamp(row.get("created_at")?),
            started_at: parse_timestamp(row.get("started_at")?),
            completed_at: parse_timestamp(row.get("completed_at")?),
        })
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub channel: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskSummary {
    pub counts: BTreeMap<TaskStatus, i64>,
    pub total: i64,
}

impl TaskSummary {
    pub fn count(&self, status: TaskStatus) -> i64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteTaskStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteTaskStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> TaskResult<SqliteTaskStore> {
        let path = self.path.ok_or(TaskError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteTaskStore { path, flags })
    }
}

/// Record of every unit of work the pipeline has picked up.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteTaskStore {
    pub fn builder() -> SqliteTaskStoreBuilder {
        SqliteTaskStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> TaskResult<Self> {
        SqliteTaskStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> TaskResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            TaskError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| TaskError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> TaskResult<()> {
        let conn = self.open()?;
        conn.execute_batch(TASKS_SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, task: &NewTask) -> TaskResult<i64> {
        let conn = self.open()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO pipeline_tasks (
                workflow_name, channel_name, prefix, file_path, status, priority,
                processing_order, created_at
            ) VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6, ?7)",
            params![
                &task.workflow_name,
                &task.channel_name,
                &task.prefix,
                task.file_path.to_string_lossy().to_string(),
                task.priority.value(),
                processing_order(now, task.priority),
                now.naive_utc()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_processing(&self, id: i64) -> TaskResult<()> {
        self.update(
            id,
            "UPDATE pipeline_tasks SET status='PROCESSING', started_at=?1 WHERE id=?2",
            params![Utc::now().naive_utc(), id],
        )
    }

    pub fn mark_completed(&self, id: i64, workflow_task_id: Option<&str>) -> TaskResult<()> {
        self.update(
            id,
            "UPDATE pipeline_tasks SET status='COMPLETED', completed_at=?1,
                workflow_task_id=COALESCE(?2, workflow_task_id), error_message=NULL
             WHERE id=?3",
            params![Utc::now().naive_utc(), workflow_task_id, id],
        )
    }

    pub fn mark_error(&self, id: i64, message: &str) -> TaskResult<()> {
        self.update(
            id,
            "UPDATE pipeline_tasks SET status='ERROR', completed_at=?1, error_message=?2
             WHERE id=?3",
            params![Utc::now().naive_utc(), message, id],
        )
    }

    fn update(&self, id: i64, sql: &str, params: impl rusqlite::Params) -> TaskResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(sql, params)?;
        if affected == 0 {
            return Err(TaskError::NotFound(id));
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> TaskResult<Option<TaskRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM pipeline_tasks WHERE id=?1",
                [id],
                TaskRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list(&self, filter: &TaskFilter) -> TaskResult<Vec<TaskRecord>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM pipeline_tasks");
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(channel) = &filter.channel {
            clauses.push("channel_name = ?");
            params.push(Value::Text(channel.clone()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(TaskRecord::from_row(row)?);
        }
        Ok(records)
    }

    pub fn summary(&self) -> TaskResult<TaskSummary> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM pipeline_tasks GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut summary = TaskSummary::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let status = status.parse()?;
            summary.total += count;
            summary.counts.insert(status, count);
        }
        Ok(summary)
    }

    pub fn next_pending(&self) -> TaskResult<Option<TaskRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM pipeline_tasks WHERE status='PENDING'
                 ORDER BY processing_order ASC, id ASC LIMIT 1",
                [],
                TaskRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Deletes finished records whose completion is older than `older_than`.
    pub fn cleanup_finished(&self, older_than: Duration) -> TaskResult<usize> {
        let conn = self.open()?;
        let cutoff = (Utc::now() - older_than).naive_utc();
        let removed = conn.execute(
            "DELETE FROM pipeline_tasks
             WHERE status IN ('COMPLETED', 'ERROR') AND completed_at < ?1",
            [cutoff],
        )?;
        Ok(removed)
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

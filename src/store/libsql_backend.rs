//! libSQL backend implementing the repository ports.
//!
//! Supports local file and in-memory databases. Status transitions are
//! applied to a loaded `Job` first, so the state machine stays the single
//! authority on legal edges, and then written back with a conditional
//! `UPDATE ... WHERE status = <prior> AND revision = <loaded>`. Zero
//! affected rows means another worker got there first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{DatabaseError, JobError, QueueError, Result};
use crate::jobs::{Job, JobStatus, Queue, QueueStatus};
use crate::store::migrations;
use crate::store::traits::{
    Annotation, AnnotationStore, AuditLog, AuditRecord, JobRepository, QueueRepository,
};

const JOB_COLUMNS: &str = "id, queue_id, name, status, priority, payload, data, result, \
     failed_reason, progress, attempts, max_attempts, delay_ms, retry_delay_ms, execute_after, \
     depends_on, created_at, updated_at, processed_at, finished_at";

const QUEUE_COLUMNS: &str = "id, name, status, created_at, updated_at";

/// libSQL-backed store.
///
/// Holds a single connection reused for all operations; `libsql::Connection`
/// is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> std::result::Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> std::result::Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> std::result::Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` to decide when delayed jobs become due.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Load a job together with its row revision.
    async fn load_versioned(&self, id: Uuid) -> Result<(Job, i64)> {
        let sql = format!("SELECT {JOB_COLUMNS}, revision FROM jobs WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("load job {id}: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read job row: {e}")))?
            .ok_or(JobError::NotFound { id })?;
        Ok((row_to_job(&row)?, col_i64(&row, 20, "revision")?))
    }

    /// Apply `f` to the stored job and write it back if the row is unchanged since loading.
    async fn transition<F>(&self, id: Uuid, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), JobError> + Send,
    {
        let (job, revision) = self.load_versioned(id).await?;
        self.write_transition(job, revision, f).await
    }

    /// Compare-and-swap on `revision`. A row that left and re-entered the
    /// same status in between still fails the check.
    async fn write_transition<F>(&self, mut job: Job, revision: i64, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), JobError> + Send,
    {
        let id = job.id;
        let prior = job.status;
        f(&mut job)?;

        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?2, result = ?3, failed_reason = ?4, progress = ?5,
                     attempts = ?6, delay_ms = ?7, execute_after = ?8, updated_at = ?9,
                     processed_at = ?10, finished_at = ?11, revision = revision + 1
                 WHERE id = ?1 AND status = ?12 AND revision = ?13",
                params![
                    id.to_string(),
                    job.status.as_str(),
                    opt_json(job.result.as_ref())?,
                    opt_text(job.failed_reason.as_deref()),
                    job.progress as i64,
                    job.attempts as i64,
                    job.delay_ms as i64,
                    opt_ts(job.execute_after),
                    fmt_ts(job.updated_at),
                    opt_ts(job.processed_at),
                    opt_ts(job.finished_at),
                    prior.as_str(),
                    revision,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update job {id}: {e}")))?;

        if affected == 0 {
            return Err(JobError::InvalidStatusTransition {
                id,
                from: prior,
                to: job.status,
            }
            .into());
        }

        debug!(job_id = %id, from = %prior, to = %job.status, "Job transitioned");
        Ok(job)
    }

    async fn query_jobs(&self, sql: &str, args: Vec<libsql::Value>) -> Result<Vec<Job>> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params::Params::Positional(args))
            .await
            .map_err(|e| DatabaseError::Query(format!("query jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read job row: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn query_queues(&self, sql: &str, args: Vec<libsql::Value>) -> Result<Vec<Queue>> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params::Params::Positional(args))
            .await
            .map_err(|e| DatabaseError::Query(format!("query queues: {e}")))?;

        let mut queues = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read queue row: {e}")))?
        {
            queues.push(row_to_queue(&row)?);
        }
        Ok(queues)
    }

    async fn annotation_tags(&self, annotation_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tag FROM annotation_tags WHERE annotation_id = ?1 ORDER BY position",
                params![annotation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query annotation tags: {e}")))?;

        let mut tags = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read annotation tag: {e}")))?
        {
            tags.push(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("annotation_tags.tag: {e}")))?,
            );
        }
        Ok(tags)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_json(v: Option<&serde_json::Value>) -> std::result::Result<libsql::Value, DatabaseError> {
    match v {
        Some(v) => Ok(libsql::Value::Text(to_json(v)?)),
        None => Ok(libsql::Value::Null),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(v: &T) -> std::result::Result<String, DatabaseError> {
    serde_json::to_string(v).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn parse_uuid(s: &str, column: &str) -> std::result::Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{column} parse: {e}")))
}

fn col_str(row: &libsql::Row, idx: i32, column: &str) -> std::result::Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{column}: {e}")))
}

fn col_i64(row: &libsql::Row, idx: i32, column: &str) -> std::result::Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{column}: {e}")))
}

fn row_to_job(row: &libsql::Row) -> std::result::Result<Job, DatabaseError> {
    let id = parse_uuid(&col_str(row, 0, "jobs.id")?, "jobs.id")?;
    let queue_id = parse_uuid(&col_str(row, 1, "jobs.queue_id")?, "jobs.queue_id")?;
    let status_str = col_str(row, 3, "jobs.status")?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Query(format!("jobs.status: {e}")))?;

    let payload: serde_json::Value =
        serde_json::from_str(&col_str(row, 5, "jobs.payload")?)
            .map_err(|e| DatabaseError::Serialization(format!("jobs.payload: {e}")))?;
    let data: serde_json::Value = serde_json::from_str(&col_str(row, 6, "jobs.data")?)
        .map_err(|e| DatabaseError::Serialization(format!("jobs.data: {e}")))?;
    let result = match row.get::<String>(7).ok() {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("jobs.result: {e}")))?,
        ),
        None => None,
    };
    let depends_on: Vec<Uuid> =
        serde_json::from_str(&row.get::<String>(15).unwrap_or_else(|_| "[]".to_string()))
            .map_err(|e| DatabaseError::Serialization(format!("jobs.depends_on: {e}")))?;

    Ok(Job {
        id,
        queue_id,
        name: col_str(row, 2, "jobs.name")?,
        status,
        priority: col_i64(row, 4, "jobs.priority")?.clamp(0, u8::MAX as i64) as u8,
        payload,
        data,
        result,
        failed_reason: row.get::<String>(8).ok(),
        progress: col_i64(row, 9, "jobs.progress")?.clamp(0, 100) as u8,
        attempts: col_i64(row, 10, "jobs.attempts")?.max(0) as u32,
        max_attempts: col_i64(row, 11, "jobs.max_attempts")?.max(0) as u32,
        delay_ms: col_i64(row, 12, "jobs.delay_ms")?.max(0) as u64,
        retry_delay_ms: col_i64(row, 13, "jobs.retry_delay_ms")?.max(0) as u64,
        execute_after: parse_optional_datetime(row.get::<String>(14).ok()),
        depends_on,
        created_at: parse_datetime(&col_str(row, 16, "jobs.created_at")?),
        updated_at: parse_datetime(&col_str(row, 17, "jobs.updated_at")?),
        processed_at: parse_optional_datetime(row.get::<String>(18).ok()),
        finished_at: parse_optional_datetime(row.get::<String>(19).ok()),
    })
}

fn row_to_queue(row: &libsql::Row) -> std::result::Result<Queue, DatabaseError> {
    let status_str = col_str(row, 2, "queues.status")?;
    Ok(Queue {
        id: parse_uuid(&col_str(row, 0, "queues.id")?, "queues.id")?,
        name: col_str(row, 1, "queues.name")?,
        status: status_str
            .parse::<QueueStatus>()
            .map_err(|e| DatabaseError::Query(format!("queues.status: {e}")))?,
        created_at: parse_datetime(&col_str(row, 3, "queues.created_at")?),
        updated_at: parse_datetime(&col_str(row, 4, "queues.updated_at")?),
    })
}

// ── Jobs ────────────────────────────────────────────────────────────

#[async_trait]
impl JobRepository for LibSqlStore {
    async fn add(&self, job: &Job) -> Result<()> {
        let queue = self
            .find_queue_by_id(job.queue_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job.queue_id.to_string()))?;
        if !queue.status.accepts_jobs() {
            return Err(QueueError::NotAcceptingJobs {
                name: queue.name,
                status: queue.status.to_string(),
            }
            .into());
        }

        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        );
        self.conn()
            .execute(
                &sql,
                params![
                    job.id.to_string(),
                    job.queue_id.to_string(),
                    job.name.clone(),
                    job.status.as_str(),
                    job.priority as i64,
                    to_json(&job.payload)?,
                    to_json(&job.data)?,
                    opt_json(job.result.as_ref())?,
                    opt_text(job.failed_reason.as_deref()),
                    job.progress as i64,
                    job.attempts as i64,
                    job.max_attempts as i64,
                    job.delay_ms as i64,
                    job.retry_delay_ms as i64,
                    opt_ts(job.execute_after),
                    to_json(&job.depends_on)?,
                    fmt_ts(job.created_at),
                    fmt_ts(job.updated_at),
                    opt_ts(job.processed_at),
                    opt_ts(job.finished_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert job: {e}")))?;

        debug!(job_id = %job.id, queue = %queue.name, priority = job.priority, "Job added");
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let mut jobs = self
            .query_jobs(&sql, vec![libsql::Value::Text(id.to_string())])
            .await?;
        Ok(jobs.pop())
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET data = ?2, progress = ?3, name = ?4, revision = revision + 1
                 WHERE id = ?1",
                params![
                    job.id.to_string(),
                    to_json(&job.data)?,
                    job.progress as i64,
                    job.name.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save job {}: {e}", job.id)))?;
        if affected == 0 {
            return Err(JobError::NotFound { id: job.id }.into());
        }
        Ok(())
    }

    async fn get_next_job(&self, queue_id: Uuid) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE queue_id = ?1
               AND (status = 'waiting'
                    OR (status = 'delayed' AND (execute_after IS NULL OR execute_after <= ?2)))
             ORDER BY priority DESC, created_at ASC
             LIMIT 1"
        );
        let mut jobs = self
            .query_jobs(
                &sql,
                vec![
                    libsql::Value::Text(queue_id.to_string()),
                    libsql::Value::Text(fmt_ts(self.clock.now())),
                ],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn mark_job_as_started(&self, id: Uuid) -> Result<Job> {
        let now = self.clock.now();
        self.transition(id, |job| {
            if job.status == JobStatus::Delayed {
                if !job.is_eligible(now) {
                    return Err(JobError::InvalidStatusTransition {
                        id: job.id,
                        from: job.status,
                        to: JobStatus::Active,
                    });
                }
                job.promote()?;
            }
            job.start()
        })
        .await
    }

    async fn mark_job_as_completed(
        &self,
        id: Uuid,
        output: Option<serde_json::Value>,
    ) -> Result<Job> {
        self.transition(id, |job| job.complete(output)).await
    }

    async fn mark_job_as_failed(&self, id: Uuid, reason: &str) -> Result<Job> {
        self.transition(id, |job| job.fail(reason)).await
    }

    async fn mark_job_as_delayed(
        &self,
        id: Uuid,
        execute_after: DateTime<Utc>,
        reason: &str,
    ) -> Result<Job> {
        let backoff = (execute_after - self.clock.now())
            .to_std()
            .unwrap_or_default();
        self.transition(id, |job| job.delay(execute_after, backoff, reason))
            .await
    }

    async fn mark_job_as_waiting(&self, id: Uuid) -> Result<Job> {
        self.transition(id, |job| job.requeue()).await
    }

    async fn requeue_orphaned_jobs(&self, queue_id: Uuid) -> Result<usize> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM jobs WHERE queue_id = ?1 AND status = 'active'");
        let orphans = self
            .query_jobs(&sql, vec![libsql::Value::Text(queue_id.to_string())])
            .await?;

        let mut count = 0;
        for job in orphans {
            match self.transition(job.id, |job| job.requeue()).await {
                Ok(_) => count += 1,
                // Finished by someone else since the scan.
                Err(e) if e.is_domain_rejection() => {
                    debug!(job_id = %job.id, error = %e, "Orphaned job moved on before requeue");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    async fn count_by_status(&self, queue_id: Uuid) -> Result<HashMap<JobStatus, usize>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM jobs WHERE queue_id = ?1 GROUP BY status",
                params![queue_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count jobs: {e}")))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read count row: {e}")))?
        {
            let status: String = col_str(&row, 0, "status")?;
            let count = col_i64(&row, 1, "count")?;
            if let Ok(status) = status.parse::<JobStatus>() {
                counts.insert(status, count as usize);
            }
        }
        Ok(counts)
    }
}

// ── Queues ──────────────────────────────────────────────────────────

#[async_trait]
impl QueueRepository for LibSqlStore {
    async fn find_queue_by_name(&self, name: &str) -> Result<Option<Queue>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM queues WHERE name = ?1");
        let mut queues = self
            .query_queues(&sql, vec![libsql::Value::Text(name.trim().to_string())])
            .await?;
        Ok(queues.pop())
    }

    async fn find_queue_by_id(&self, id: Uuid) -> Result<Option<Queue>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM queues WHERE id = ?1");
        let mut queues = self
            .query_queues(&sql, vec![libsql::Value::Text(id.to_string())])
            .await?;
        Ok(queues.pop())
    }

    async fn create_queue(&self, name: &str) -> Result<Queue> {
        let queue = Queue::new(name)?;
        if self.find_queue_by_name(&queue.name).await?.is_some() {
            return Err(QueueError::DuplicateName(queue.name).into());
        }
        self.conn()
            .execute(
                "INSERT INTO queues (id, name, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    queue.id.to_string(),
                    queue.name.clone(),
                    queue.status.as_str(),
                    fmt_ts(queue.created_at),
                    fmt_ts(queue.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("insert queue {}: {e}", queue.name)))?;
        info!(queue = %queue.name, "Queue created");
        Ok(queue)
    }

    async fn save_queue(&self, queue: &Queue) -> Result<()> {
        if let Some(existing) = self.find_queue_by_name(&queue.name).await?
            && existing.id != queue.id
        {
            return Err(QueueError::DuplicateName(queue.name.clone()).into());
        }
        self.conn()
            .execute(
                "INSERT INTO queues (id, name, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     status = excluded.status,
                     updated_at = excluded.updated_at",
                params![
                    queue.id.to_string(),
                    queue.name.clone(),
                    queue.status.as_str(),
                    fmt_ts(queue.created_at),
                    fmt_ts(queue.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save queue {}: {e}", queue.name)))?;
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM queues ORDER BY name");
        self.query_queues(&sql, Vec::new()).await
    }

    async fn delete_queue(&self, id: Uuid) -> Result<bool> {
        self.conn()
            .execute("DELETE FROM jobs WHERE queue_id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete jobs of queue {id}: {e}")))?;
        let affected = self
            .conn()
            .execute("DELETE FROM queues WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete queue {id}: {e}")))?;
        Ok(affected > 0)
    }
}

// ── Annotations ─────────────────────────────────────────────────────

#[async_trait]
impl AnnotationStore for LibSqlStore {
    async fn record(&self, annotation: Annotation) -> Result<()> {
        let id = annotation.id.to_string();
        self.conn()
            .execute(
                "INSERT INTO annotations (id, content, job_id, agent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.clone(),
                    annotation.content.clone(),
                    opt_text(annotation.job_id.map(|j| j.to_string()).as_deref()),
                    opt_text(annotation.agent_id.as_deref()),
                    fmt_ts(annotation.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert annotation: {e}")))?;

        for (position, tag) in annotation.tags.iter().enumerate() {
            self.conn()
                .execute(
                    "INSERT OR IGNORE INTO annotation_tags (annotation_id, tag, position)
                     VALUES (?1, ?2, ?3)",
                    params![id.clone(), tag.clone(), position as i64],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert annotation tag: {e}")))?;
        }
        Ok(())
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Vec<Annotation>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT a.id, a.content, a.job_id, a.agent_id, a.created_at
                 FROM annotations a
                 JOIN annotation_tags t ON t.annotation_id = a.id
                 WHERE t.tag = ?1
                 ORDER BY a.created_at ASC",
                params![tag],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query annotations: {e}")))?;

        let mut found = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read annotation row: {e}")))?
        {
            let id_str = col_str(&row, 0, "annotations.id")?;
            let job_id = match row.get::<String>(2).ok() {
                Some(s) => Some(parse_uuid(&s, "annotations.job_id")?),
                None => None,
            };
            found.push(Annotation {
                id: parse_uuid(&id_str, "annotations.id")?,
                content: col_str(&row, 1, "annotations.content")?,
                tags: Vec::new(),
                job_id,
                agent_id: row.get::<String>(3).ok(),
                created_at: parse_datetime(&col_str(&row, 4, "annotations.created_at")?),
            });
        }

        for annotation in &mut found {
            annotation.tags = self.annotation_tags(&annotation.id.to_string()).await?;
        }
        Ok(found)
    }
}

// ── Audit log ───────────────────────────────────────────────────────

#[async_trait]
impl AuditLog for LibSqlStore {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        for record in records {
            self.conn()
                .execute(
                    "INSERT INTO job_audit (job_id, kind, name, detail, error, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.job_id.to_string(),
                        record.kind.clone(),
                        opt_text(record.name.as_deref()),
                        to_json(&record.detail)?,
                        opt_text(record.error.as_deref()),
                        fmt_ts(record.recorded_at),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert audit record: {e}")))?;
        }
        Ok(())
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<AuditRecord>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT kind, name, detail, error, recorded_at FROM job_audit
                 WHERE job_id = ?1 ORDER BY seq ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query audit log: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read audit row: {e}")))?
        {
            let detail: serde_json::Value =
                serde_json::from_str(&col_str(&row, 2, "job_audit.detail")?)
                    .map_err(|e| DatabaseError::Serialization(format!("job_audit.detail: {e}")))?;
            records.push(AuditRecord {
                job_id,
                kind: col_str(&row, 0, "job_audit.kind")?,
                name: row.get::<String>(1).ok(),
                detail,
                error: row.get::<String>(3).ok(),
                recorded_at: parse_datetime(&col_str(&row, 4, "job_audit.recorded_at")?),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;

    async fn store() -> (LibSqlStore, Queue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = LibSqlStore::new_memory()
            .await
            .unwrap()
            .with_clock(clock.clone());
        let queue = store.create_queue("default").await.unwrap();
        (store, queue, clock)
    }

    #[tokio::test]
    async fn job_round_trips_through_sql() {
        let (store, queue, _) = store().await;
        let job = Job::new(queue.id, "build", serde_json::json!({"goal": "x"}))
            .with_priority(7)
            .unwrap()
            .with_retry_delay_ms(250);
        store.add(&job).await.unwrap();

        let loaded = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "build");
        assert_eq!(loaded.priority(), 7);
        assert_eq!(loaded.payload(), &serde_json::json!({"goal": "x"}));
        assert_eq!(loaded.status(), JobStatus::Waiting);
        assert_eq!(loaded.retry_delay_ms, 250);
        assert!(loaded.data.is_null());
    }

    #[tokio::test]
    async fn full_lifecycle_with_delay() {
        let (store, queue, clock) = store().await;
        let job = Job::new(queue.id, "j", serde_json::json!({}));
        store.add(&job).await.unwrap();

        store.mark_job_as_started(job.id).await.unwrap();
        assert!(store.mark_job_as_started(job.id).await.unwrap_err().is_domain_rejection());

        store
            .mark_job_as_delayed(job.id, clock.now() + Duration::seconds(2), "boom")
            .await
            .unwrap();
        assert!(store.get_next_job(queue.id).await.unwrap().is_none());

        clock.advance(Duration::seconds(3));
        let next = store.get_next_job(queue.id).await.unwrap().unwrap();
        assert_eq!(next.id, job.id);
        store.mark_job_as_started(job.id).await.unwrap();

        let done = store
            .mark_job_as_completed(job.id, Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(done.status(), JobStatus::Completed);

        let loaded = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts(), 1);
        assert_eq!(loaded.progress(), 100);
        assert_eq!(loaded.result(), Some(&serde_json::json!({"ok": true})));
        assert_eq!(loaded.failed_reason(), Some("boom"));
        assert!(loaded.finished_at().is_some());
    }

    #[tokio::test]
    async fn next_job_ordering() {
        let (store, queue, _) = store().await;
        let low = Job::new(queue.id, "low", serde_json::json!({}));
        let mut old = Job::new(queue.id, "old", serde_json::json!({}))
            .with_priority(3)
            .unwrap();
        old.created_at -= Duration::minutes(1);
        let new = Job::new(queue.id, "new", serde_json::json!({}))
            .with_priority(3)
            .unwrap();
        for job in [&low, &new, &old] {
            store.add(job).await.unwrap();
        }
        assert_eq!(store.get_next_job(queue.id).await.unwrap().unwrap().id, old.id);
    }

    #[tokio::test]
    async fn save_persists_data_only() {
        let (store, queue, _) = store().await;
        let mut job = Job::new(queue.id, "j", serde_json::json!({}));
        store.add(&job).await.unwrap();

        job.data = serde_json::json!({"conversationHistory": []});
        job.set_progress(40);
        store.save(&job).await.unwrap();

        let loaded = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, job.data);
        assert_eq!(loaded.progress(), 40);
        assert_eq!(loaded.status(), JobStatus::Waiting);
    }

    #[tokio::test]
    async fn queue_management() {
        let (store, queue, _) = store().await;
        assert!(matches!(
            store.create_queue(" default ").await,
            Err(Error::Queue(QueueError::DuplicateName(_)))
        ));

        store.save_queue(&queue.drain()).await.unwrap();
        let loaded = store.find_queue_by_name("default").await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Draining);
        assert!(store.add(&Job::new(queue.id, "j", serde_json::json!({}))).await.is_err());

        store.create_queue("other").await.unwrap();
        let names: Vec<String> = store
            .list_queues()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.name)
            .collect();
        assert_eq!(names, vec!["default", "other"]);

        assert!(store.delete_queue(queue.id).await.unwrap());
        assert!(store.find_queue_by_id(queue.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_recovery_and_counts() {
        let (store, queue, _) = store().await;
        let a = Job::new(queue.id, "a", serde_json::json!({}));
        store.add(&a).await.unwrap();
        store.mark_job_as_started(a.id).await.unwrap();

        assert_eq!(store.requeue_orphaned_jobs(queue.id).await.unwrap(), 1);
        let counts = store.count_by_status(queue.id).await.unwrap();
        assert_eq!(counts.get(&JobStatus::Waiting), Some(&1));
    }

    #[tokio::test]
    async fn orphan_recovery_leaves_other_jobs_alone() {
        let (store, queue, clock) = store().await;
        let active = Job::new(queue.id, "active", serde_json::json!({}));
        let delayed = Job::new(queue.id, "delayed", serde_json::json!({}));
        let done = Job::new(queue.id, "done", serde_json::json!({}));
        for job in [&active, &delayed, &done] {
            store.add(job).await.unwrap();
            store.mark_job_as_started(job.id).await.unwrap();
        }
        store
            .mark_job_as_delayed(delayed.id, clock.now() + Duration::seconds(5), "later")
            .await
            .unwrap();
        store.mark_job_as_completed(done.id, None).await.unwrap();

        assert_eq!(store.requeue_orphaned_jobs(queue.id).await.unwrap(), 1);
        let requeued = store.find_by_id(active.id).await.unwrap().unwrap();
        assert_eq!(requeued.status(), JobStatus::Waiting);
        assert_eq!(requeued.attempts(), 0);
        assert_eq!(
            store.find_by_id(delayed.id).await.unwrap().unwrap().status(),
            JobStatus::Delayed
        );
        assert_eq!(
            store.find_by_id(done.id).await.unwrap().unwrap().status(),
            JobStatus::Completed
        );

        // A recovered job can be claimed again through the normal path.
        store.mark_job_as_started(active.id).await.unwrap();
    }

    #[tokio::test]
    async fn stale_snapshot_loses_claim_after_round_trip() {
        let (store, queue, _) = store().await;
        let job = Job::new(queue.id, "j", serde_json::json!({}));
        store.add(&job).await.unwrap();

        let (stale, revision) = store.load_versioned(job.id).await.unwrap();
        assert_eq!(stale.status(), JobStatus::Waiting);

        // Another loop runs a whole turn: WAITING -> ACTIVE -> WAITING.
        store.mark_job_as_started(job.id).await.unwrap();
        let mut fresh = store.find_by_id(job.id).await.unwrap().unwrap();
        fresh.data = serde_json::json!({"turns": 1});
        store.save(&fresh).await.unwrap();
        store.mark_job_as_waiting(job.id).await.unwrap();

        let err = store
            .write_transition(stale, revision, |j| j.start())
            .await
            .unwrap_err();
        assert!(err.is_domain_rejection());

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Waiting);
        assert_eq!(stored.data, serde_json::json!({"turns": 1}));

        // The current revision still claims normally.
        store.mark_job_as_started(job.id).await.unwrap();
    }

    #[tokio::test]
    async fn annotations_and_audit() {
        let (store, _, _) = store().await;
        let job_id = Uuid::new_v4();
        store
            .record(
                Annotation::new(
                    "Which auth method?",
                    vec!["clarification_needed".into(), format!("job:{job_id}")],
                )
                .for_job(job_id),
            )
            .await
            .unwrap();

        let found = store.find_by_tag("clarification_needed").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_id, Some(job_id));
        assert_eq!(found[0].tags[1], format!("job:{job_id}"));

        let record = AuditRecord {
            job_id,
            kind: "tool_call".into(),
            name: Some("write_file".into()),
            detail: serde_json::json!({"path": "x"}),
            error: None,
            recorded_at: Utc::now(),
        };
        store.append(&[record.clone(), record]).await.unwrap();
        let listed = store.list_for_job(job_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name.as_deref(), Some("write_file"));
    }
}

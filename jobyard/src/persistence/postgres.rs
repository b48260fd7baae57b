use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::PersistenceConfig;
use crate::error::{JobError, Result};
use crate::job::{
    Job, JobFilter, JobId, JobLogEntry, JobStatus, LogLevel, NewJob,
    StatusUpdate,
};
use crate::lease::{JobLease, LeaseRequest};
use crate::queue::QueueConfig;
use crate::recurring::{NewRecurringJob, RecurringJob, RecurringJobId};
use crate::retry::RetryPolicy;
use crate::stats::{
    bucket_metrics, BucketSize, CleanupReport, LatencySummary, MetricsBucket,
    QueueStats,
};
use crate::store::{JobStore, RecurringJobStore, WorkerRegistry};
use crate::workers::{
    WorkerRecord, WorkerRegistration, WorkerStatus,
};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Picks and locks the best eligible job of one queue, skipping rows other
/// transactions hold, and marks it leased in the same statement.
const LEASE_SQL: &str = r#"
    WITH next AS (
        SELECT j.id
        FROM jobs j
        WHERE j.queue_name = $1
          AND j.attempts < j.max_attempts
          AND (j.scheduled_for IS NULL OR j.scheduled_for <= $2)
          AND (
                (j.status IN ('queued', 'delayed')
                    AND (j.next_retry_at IS NULL OR j.next_retry_at <= $2))
             OR (j.status = 'failed'
                    AND j.next_retry_at IS NOT NULL
                    AND j.next_retry_at <= $2)
          )
          AND NOT EXISTS (
                SELECT 1
                FROM job_dependencies d
                JOIN jobs dep ON dep.id = d.depends_on
                WHERE d.job_id = j.id
                  AND dep.status <> 'completed'
          )
        ORDER BY j.priority DESC, j.created_at ASC, j.id ASC
        LIMIT 1
        FOR UPDATE OF j SKIP LOCKED
    )
    UPDATE jobs
    SET status = 'processing',
        locked_by = $3,
        locked_at = $2,
        started_at = $2,
        updated_at = $2
    FROM next
    WHERE jobs.id = next.id
    RETURNING jobs.*
"#;

/// Terminal rows: completed, cancelled, or failed with no retry left.
const TERMINAL_PREDICATE: &str = r#"
    (status IN ('completed', 'cancelled')
        OR (status = 'failed'
            AND (next_retry_at IS NULL OR attempts >= max_attempts)))
    AND COALESCE(completed_at, failed_at, updated_at) < $1
"#;

/// PostgreSQL-backed job store.
///
/// All timestamps written come from the injected [`Clock`], not from
/// `NOW()`, so the store agrees with the scheduler on what time it is.
#[derive(Clone, Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Open a pool sized by `config`.
    pub async fn connect(config: &PersistenceConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.connection_string)
            .await?;
        info!(
            max_connections = config.max_connections,
            "connected to postgres"
        );
        Ok(Self::new(pool))
    }

    /// Use `clock` for every timestamp this store writes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| JobError::Database(e.into()))?;
        info!("database migrations applied");
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn is_violation(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let progress: i16 = row.try_get("progress")?;
    let recurring: Option<Uuid> = row.try_get("recurring_job_id")?;
    Ok(Job {
        id: JobId(row.try_get("id")?),
        tenant_id: row.try_get("tenant_id")?,
        queue_name: row.try_get("queue_name")?,
        job_type: row.try_get("job_type")?,
        priority: row.try_get("priority")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        scheduled_for: row.try_get("scheduled_for")?,
        next_retry_at: row.try_get("next_retry_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        progress: u8::try_from(progress.clamp(0, 100)).unwrap_or_default(),
        progress_data: row.try_get("progress_data")?,
        result: row.try_get("result")?,
        error_message: row.try_get("error_message")?,
        error_stack: row.try_get("error_stack")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        idempotency_key: row.try_get("idempotency_key")?,
        recurring_job_id: recurring.map(RecurringJobId),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
    })
}

fn queue_from_row(row: &PgRow) -> Result<QueueConfig> {
    Ok(QueueConfig {
        name: row.try_get("name")?,
        concurrency_limit: row.try_get("concurrency_limit")?,
        retry_delay_seconds: row.try_get("retry_delay_seconds")?,
        max_retries: row.try_get("max_retries")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        is_paused: row.try_get("is_paused")?,
    })
}

fn worker_from_row(row: &PgRow) -> Result<WorkerRecord> {
    let status: String = row.try_get("status")?;
    let pid: i32 = row.try_get("pid")?;
    let current: Option<Uuid> = row.try_get("current_job_id")?;
    Ok(WorkerRecord {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        pid: u32::try_from(pid).unwrap_or_default(),
        queues: row.try_get("queues")?,
        status: status.parse()?,
        current_job_id: current.map(JobId),
        last_heartbeat: row.try_get("last_heartbeat")?,
        started_at: row.try_get("started_at")?,
        stopped_at: row.try_get("stopped_at")?,
    })
}

fn recurring_from_row(row: &PgRow) -> Result<RecurringJob> {
    Ok(RecurringJob {
        id: RecurringJobId(row.try_get("id")?),
        name: row.try_get("name")?,
        tenant_id: row.try_get("tenant_id")?,
        queue_name: row.try_get("queue_name")?,
        job_type: row.try_get("job_type")?,
        payload_template: row.try_get("payload_template")?,
        cron_expression: row.try_get("cron_expression")?,
        interval_seconds: row.try_get("interval_seconds")?,
        timezone: row.try_get("timezone")?,
        priority: row.try_get("priority")?,
        is_enabled: row.try_get("is_enabled")?,
        last_run_at: row.try_get("last_run_at")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn load_queue(
    conn: &mut PgConnection,
    name: &str,
    lock: bool,
) -> Result<Option<QueueConfig>> {
    let sql = if lock {
        "SELECT * FROM job_queues WHERE name = $1 FOR UPDATE"
    } else {
        "SELECT * FROM job_queues WHERE name = $1"
    };
    sqlx::query(sql)
        .bind(name)
        .fetch_optional(conn)
        .await?
        .map(|row| queue_from_row(&row))
        .transpose()
}

async fn find_by_idempotency_key(
    conn: &mut PgConnection,
    tenant_id: Option<Uuid>,
    key: &str,
) -> Result<Option<JobId>> {
    let row = sqlx::query(
        r#"
        SELECT id FROM jobs
        WHERE idempotency_key = $2
          AND tenant_id IS NOT DISTINCT FROM $1
        "#,
    )
    .bind(tenant_id)
    .bind(key)
    .fetch_optional(conn)
    .await?;
    Ok(match row {
        Some(row) => Some(JobId(row.try_get("id")?)),
        None => None,
    })
}

async fn write_job(conn: &mut PgConnection, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            attempts = $3,
            next_retry_at = $4,
            locked_by = $5,
            locked_at = $6,
            progress = $7,
            progress_data = $8,
            result = $9,
            error_message = $10,
            error_stack = $11,
            processing_time_ms = $12,
            updated_at = $13,
            started_at = $14,
            completed_at = $15,
            failed_at = $16
        WHERE id = $1
        "#,
    )
    .bind(job.id.0)
    .bind(job.status.as_str())
    .bind(job.attempts)
    .bind(job.next_retry_at)
    .bind(&job.locked_by)
    .bind(job.locked_at)
    .bind(i16::from(job.progress))
    .bind(&job.progress_data)
    .bind(&job.result)
    .bind(&job.error_message)
    .bind(&job.error_stack)
    .bind(job.processing_time_ms)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.failed_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId> {
        let now = self.now();
        let queue = self.queue_config(&new_job.queue_name).await?;
        let depends_on = new_job.options.depends_on.clone();
        let job = new_job.into_job(&queue, now)?;

        let mut tx = self.pool.begin().await?;

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) =
                find_by_idempotency_key(&mut tx, job.tenant_id, key).await?
            {
                debug!(job_id = %existing, "idempotency key matched existing job");
                tx.rollback().await?;
                return Ok(existing);
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, queue_name, job_type, priority, payload, status,
                attempts, max_attempts, scheduled_for, timeout_seconds,
                idempotency_key, recurring_job_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, $10, $11, $12, $13, $13)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.0)
        .bind(job.tenant_id)
        .bind(&job.queue_name)
        .bind(&job.job_type)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.max_attempts)
        .bind(job.scheduled_for)
        .bind(job.timeout_seconds)
        .bind(&job.idempotency_key)
        .bind(job.recurring_job_id.map(|id| id.0))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            // Lost an idempotency race to a concurrent insert.
            let key = job.idempotency_key.as_deref().unwrap_or_default();
            let existing =
                find_by_idempotency_key(&mut tx, job.tenant_id, key)
                    .await?
                    .ok_or_else(|| {
                        JobError::Conflict(format!(
                            "job {} conflicts with an existing row",
                            job.id
                        ))
                    })?;
            tx.rollback().await?;
            return Ok(existing);
        }

        for dep in depends_on {
            let res = sqlx::query(
                r#"
                INSERT INTO job_dependencies (job_id, depends_on, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(job.id.0)
            .bind(dep.0)
            .bind(now)
            .execute(&mut *tx)
            .await;
            match res {
                Ok(_) => {}
                Err(err) if is_violation(&err, FOREIGN_KEY_VIOLATION) => {
                    return Err(JobError::JobNotFound(dep));
                }
                Err(err) => return Err(err.into()),
            }
        }

        tx.commit().await?;
        Ok(job.id)
    }

    async fn get(&self, job_id: JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobError::JobNotFound(job_id))?;
        job_from_row(&row)
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR queue_name = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::text IS NULL OR job_type = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.tenant_id)
        .bind(&filter.queue_name)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.job_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn lease_next(
        &self,
        request: &LeaseRequest,
    ) -> Result<Option<JobLease>> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;

        let queue = load_queue(&mut tx, &request.queue_name, false)
            .await?
            .unwrap_or_else(|| QueueConfig::new(&request.queue_name));
        if queue.is_paused {
            tx.rollback().await?;
            return Ok(None);
        }

        if queue.concurrency_limit > 0 {
            // Serialize leases of a limited queue on its policy row.
            let locked = load_queue(&mut tx, &request.queue_name, true)
                .await?
                .unwrap_or(queue);
            let processing: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM jobs WHERE queue_name = $1 AND status = 'processing'",
            )
            .bind(&request.queue_name)
            .fetch_one(&mut *tx)
            .await?;
            if locked.is_paused
                || locked.is_saturated(usize::try_from(processing).unwrap_or(0))
            {
                tx.rollback().await?;
                return Ok(None);
            }
        }

        let row = sqlx::query(LEASE_SQL)
            .bind(&request.queue_name)
            .bind(now)
            .bind(&request.worker_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        match row {
            Some(row) => Ok(JobLease::from_job(job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        job_id: JobId,
        update: StatusUpdate,
    ) -> Result<Job> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(JobError::JobNotFound(job_id))?;
        let mut job = job_from_row(&row)?;

        let policy = match update {
            StatusUpdate::Failed { .. } => {
                let queue = load_queue(&mut tx, &job.queue_name, false)
                    .await?
                    .unwrap_or_else(|| QueueConfig::new(&job.queue_name));
                RetryPolicy::for_queue(&queue)
            }
            _ => RetryPolicy::default(),
        };

        job.apply_update(&update, &policy, now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: u8,
        data: Option<Value>,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $3,
                progress_data = COALESCE($4, progress_data),
                updated_at = $5
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
            "#,
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(i16::from(progress.min(100)))
        .bind(data)
        .bind(self.now())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            self.get(job_id).await?;
            return Err(JobError::LeaseNotHeld {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: &str,
        details: Option<Value>,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO job_logs (id, job_id, level, message, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job_id.0)
        .bind(level.as_str())
        .bind(message)
        .bind(details)
        .bind(self.now())
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(err) if is_violation(&err, FOREIGN_KEY_VIOLATION) => {
                Err(JobError::JobNotFound(job_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn logs(&self, job_id: JobId) -> Result<Vec<JobLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM job_logs WHERE job_id = $1 ORDER BY created_at, id",
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level")?;
                Ok(JobLogEntry {
                    id: row.try_get("id")?,
                    job_id: JobId(row.try_get("job_id")?),
                    level: level.parse()?,
                    message: row.try_get("message")?,
                    details: row.try_get("details")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn add_dependency(
        &self,
        job_id: JobId,
        depends_on: JobId,
    ) -> Result<()> {
        if job_id == depends_on {
            return Err(JobError::validation("a job cannot depend on itself"));
        }
        let mut tx = self.pool.begin().await?;
        for id in [job_id, depends_on] {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)",
            )
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?;
            if !exists {
                return Err(JobError::JobNotFound(id));
            }
        }

        let creates_cycle: bool = sqlx::query_scalar(
            r#"
            WITH RECURSIVE upstream AS (
                SELECT depends_on FROM job_dependencies WHERE job_id = $2
                UNION
                SELECT d.depends_on
                FROM job_dependencies d
                JOIN upstream u ON d.job_id = u.depends_on
            )
            SELECT EXISTS (SELECT 1 FROM upstream WHERE depends_on = $1)
            "#,
        )
        .bind(job_id.0)
        .bind(depends_on.0)
        .fetch_one(&mut *tx)
        .await?;
        if creates_cycle {
            return Err(JobError::validation(format!(
                "dependency {job_id} -> {depends_on} would create a cycle"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO job_dependencies (job_id, depends_on, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job_id.0)
        .bind(depends_on.0)
        .bind(self.now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn dependencies(&self, job_id: JobId) -> Result<Vec<JobId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT depends_on FROM job_dependencies WHERE job_id = $1 ORDER BY created_at, depends_on",
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn promote_delayed(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', updated_at = $1
            WHERE status = 'delayed' AND scheduled_for <= $1
            "#,
        )
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn reclaim_stuck(&self, stuck_after: Duration) -> Result<Vec<JobId>> {
        let now = self.now();
        let Some(cutoff) = now.checked_sub_signed(stuck_after) else {
            return Ok(Vec::new());
        };
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'queued',
                locked_by = NULL,
                locked_at = NULL,
                started_at = NULL,
                updated_at = $1
            WHERE status = 'processing' AND locked_at < $2
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn upsert_queue(&self, config: QueueConfig) -> Result<QueueConfig> {
        config.validate()?;
        let row = sqlx::query(
            r#"
            INSERT INTO job_queues (
                name, concurrency_limit, retry_delay_seconds, max_retries,
                timeout_seconds, is_paused, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (name) DO UPDATE
            SET concurrency_limit = EXCLUDED.concurrency_limit,
                retry_delay_seconds = EXCLUDED.retry_delay_seconds,
                max_retries = EXCLUDED.max_retries,
                timeout_seconds = EXCLUDED.timeout_seconds,
                is_paused = EXCLUDED.is_paused,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(&config.name)
        .bind(config.concurrency_limit)
        .bind(config.retry_delay_seconds)
        .bind(config.max_retries)
        .bind(config.timeout_seconds)
        .bind(config.is_paused)
        .bind(self.now())
        .fetch_one(&self.pool)
        .await?;
        queue_from_row(&row)
    }

    async fn queue_config(&self, name: &str) -> Result<QueueConfig> {
        let mut conn = self.pool.acquire().await?;
        Ok(load_queue(&mut conn, name, false)
            .await?
            .unwrap_or_else(|| QueueConfig::new(name)))
    }

    async fn list_queues(&self) -> Result<Vec<QueueConfig>> {
        let rows = sqlx::query("SELECT * FROM job_queues ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(queue_from_row).collect()
    }

    async fn queue_stats(&self, name: &str) -> Result<QueueStats> {
        let mut stats = QueueStats::new(name);

        let rows = sqlx::query(
            r#"
            SELECT status,
                   COUNT(*) AS count,
                   COUNT(*) FILTER (
                       WHERE next_retry_at IS NOT NULL
                         AND attempts < max_attempts
                   ) AS retry_pending
            FROM jobs
            WHERE queue_name = $1
            GROUP BY status
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let status: JobStatus = status.parse()?;
            let count: i64 = row.try_get("count")?;
            stats.add_status(status, u64::try_from(count).unwrap_or(0));
            if status == JobStatus::Failed {
                let pending: i64 = row.try_get("retry_pending")?;
                stats.retry_pending = u64::try_from(pending).unwrap_or(0);
            }
        }

        let row = sqlx::query(
            r#"
            SELECT COUNT(started_at) AS wait_samples,
                   AVG(EXTRACT(EPOCH FROM (started_at - created_at)) * 1000)::float8
                       AS wait_avg,
                   MAX(EXTRACT(EPOCH FROM (started_at - created_at)) * 1000)::bigint
                       AS wait_max,
                   COUNT(processing_time_ms) FILTER (WHERE status = 'completed')
                       AS run_samples,
                   (AVG(processing_time_ms) FILTER (WHERE status = 'completed'))::float8
                       AS run_avg,
                   MAX(processing_time_ms) FILTER (WHERE status = 'completed')
                       AS run_max
            FROM jobs
            WHERE queue_name = $1
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        let wait_samples: i64 = row.try_get("wait_samples")?;
        let run_samples: i64 = row.try_get("run_samples")?;
        stats.wait_time = LatencySummary::from_parts(
            u64::try_from(wait_samples).unwrap_or(0),
            row.try_get("wait_avg")?,
            row.try_get("wait_max")?,
        );
        stats.processing_time = LatencySummary::from_parts(
            u64::try_from(run_samples).unwrap_or(0),
            row.try_get("run_avg")?,
            row.try_get("run_max")?,
        );
        Ok(stats)
    }

    async fn all_queue_stats(&self) -> Result<Vec<QueueStats>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM job_queues
            UNION
            SELECT DISTINCT queue_name FROM jobs
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.queue_stats(&name).await?);
        }
        Ok(out)
    }

    async fn queue_metrics(
        &self,
        name: &str,
        bucket: BucketSize,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricsBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = $1
              AND (created_at >= $2
                   OR started_at >= $2
                   OR completed_at >= $2
                   OR failed_at >= $2)
            "#,
        )
        .bind(name)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        Ok(bucket_metrics(&jobs, name, bucket, since))
    }

    async fn cleanup(&self, retention: Duration) -> Result<CleanupReport> {
        let Some(cutoff) = self.now().checked_sub_signed(retention) else {
            return Ok(CleanupReport::default());
        };
        let mut tx = self.pool.begin().await?;

        // Jobs still depended on by a surviving job are kept, along with
        // their own dependencies.
        let doomed: Vec<Uuid> = sqlx::query_scalar(&format!(
            r#"
            WITH RECURSIVE candidates AS (
                SELECT id FROM jobs WHERE {TERMINAL_PREDICATE}
            ),
            protected AS (
                SELECT d.depends_on AS id
                FROM job_dependencies d
                WHERE d.job_id NOT IN (SELECT id FROM candidates)
                UNION
                SELECT d.depends_on
                FROM job_dependencies d
                JOIN protected p ON d.job_id = p.id
            )
            SELECT id FROM candidates
            WHERE id NOT IN (SELECT id FROM protected)
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let logs = sqlx::query("DELETE FROM job_logs WHERE job_id = ANY($1)")
            .bind(&doomed)
            .execute(&mut *tx)
            .await?;
        let jobs = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(&doomed)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CleanupReport {
            jobs_deleted: jobs.rows_affected(),
            logs_deleted: logs.rows_affected(),
        })
    }
}

#[async_trait]
impl WorkerRegistry for PostgresJobStore {
    async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerRecord> {
        let pid = i32::try_from(registration.pid)
            .map_err(|_| JobError::validation("pid out of range"))?;
        let row = sqlx::query(
            r#"
            INSERT INTO workers (
                id, hostname, pid, queues, status, current_job_id,
                last_heartbeat, started_at, stopped_at
            )
            VALUES ($1, $2, $3, $4, 'active', NULL, $5, $5, NULL)
            ON CONFLICT (id) DO UPDATE
            SET hostname = EXCLUDED.hostname,
                pid = EXCLUDED.pid,
                queues = EXCLUDED.queues,
                status = 'active',
                current_job_id = NULL,
                last_heartbeat = EXCLUDED.last_heartbeat,
                started_at = EXCLUDED.started_at,
                stopped_at = NULL
            RETURNING *
            "#,
        )
        .bind(&registration.worker_id)
        .bind(&registration.hostname)
        .bind(pid)
        .bind(&registration.queues)
        .bind(self.now())
        .fetch_one(&self.pool)
        .await?;
        worker_from_row(&row)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        current_job_id: Option<JobId>,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat = $2,
                current_job_id = $3,
                status = 'active',
                stopped_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(self.now())
        .bind(current_job_id.map(|id| id.0))
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(JobError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'stopped',
                current_job_id = NULL,
                stopped_at = COALESCE(stopped_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(JobError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    async fn stop_silent_workers(
        &self,
        silence: Duration,
    ) -> Result<Vec<String>> {
        let now = self.now();
        let Some(cutoff) = now.checked_sub_signed(silence) else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workers
            SET status = 'stopped',
                current_job_id = NULL,
                stopped_at = $1
            WHERE status = 'active' AND last_heartbeat < $2
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workers
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY started_at, id
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(worker_from_row).collect()
    }
}

#[async_trait]
impl RecurringJobStore for PostgresJobStore {
    async fn create_recurring(
        &self,
        definition: NewRecurringJob,
    ) -> Result<RecurringJob> {
        let recurring = definition.into_recurring(self.now())?;
        let res = sqlx::query(
            r#"
            INSERT INTO recurring_jobs (
                id, name, tenant_id, queue_name, job_type, payload_template,
                cron_expression, interval_seconds, timezone, priority,
                is_enabled, last_run_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL, $12)
            "#,
        )
        .bind(recurring.id.0)
        .bind(&recurring.name)
        .bind(recurring.tenant_id)
        .bind(&recurring.queue_name)
        .bind(&recurring.job_type)
        .bind(&recurring.payload_template)
        .bind(&recurring.cron_expression)
        .bind(recurring.interval_seconds)
        .bind(&recurring.timezone)
        .bind(recurring.priority)
        .bind(recurring.is_enabled)
        .bind(recurring.created_at)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(recurring),
            Err(err) if is_violation(&err, UNIQUE_VIOLATION) => {
                Err(JobError::Conflict(format!(
                    "recurring job {} already exists",
                    recurring.name
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_recurring(&self, id: RecurringJobId) -> Result<RecurringJob> {
        let row = sqlx::query("SELECT * FROM recurring_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobError::RecurringJobNotFound(id))?;
        recurring_from_row(&row)
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>> {
        let rows = sqlx::query("SELECT * FROM recurring_jobs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(recurring_from_row).collect()
    }

    async fn delete_recurring(&self, id: RecurringJobId) -> Result<()> {
        let res = sqlx::query("DELETE FROM recurring_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(JobError::RecurringJobNotFound(id));
        }
        Ok(())
    }

    async fn claim_recurring_run(
        &self,
        id: RecurringJobId,
        expected: Option<DateTime<Utc>>,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE recurring_jobs
            SET last_run_at = $3
            WHERE id = $1 AND last_run_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id.0)
        .bind(expected)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

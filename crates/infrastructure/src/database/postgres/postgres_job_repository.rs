use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketpilot_core::{EngineError, EngineResult};
use marketpilot_domain::entities::{
    FailureKind, Job, JobFilter, JobOutcome, JobStatus, LastError, NewJob,
};
use marketpilot_domain::repositories::JobRepository;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

const JOB_COLUMNS: &str = "id, account_id, kind, payload, scheduled_at, status, attempt_count, \
     max_attempts, reauth_count, cancel_requested, last_error_kind, last_error_message, \
     dedup_key, created_at, completed_at";

pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> EngineResult<Job> {
        let last_error = match (
            row.try_get::<Option<String>, _>("last_error_kind")?,
            row.try_get::<Option<String>, _>("last_error_message")?,
        ) {
            (Some(kind), Some(message)) => Some(LastError {
                kind: FailureKind::parse_str(&kind).map_err(EngineError::Serialization)?,
                message,
            }),
            _ => None,
        };

        Ok(Job {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            scheduled_at: row.try_get("scheduled_at")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            reauth_count: row.try_get("reauth_count")?,
            cancel_requested: row.try_get("cancel_requested")?,
            last_error,
            dedup_key: row.try_get("dedup_key")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn insert(&self, new_job: &NewJob, ignore_conflict: bool) -> EngineResult<Option<Job>> {
        let conflict_clause = if ignore_conflict {
            "ON CONFLICT (dedup_key) DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO jobs (account_id, kind, payload, scheduled_at, status, max_attempts, dedup_key, created_at) \
             VALUES ($1, $2, $3, $4, 'PENDING', $5, $6, $7) \
             {conflict_clause} \
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&new_job.account_id)
            .bind(new_job.kind)
            .bind(&new_job.payload)
            .bind(new_job.scheduled_at)
            .bind(new_job.max_attempts)
            .bind(&new_job.dedup_key)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn classify_failed_transition(&self, id: i64, target: JobStatus) -> EngineError {
        match self.get_by_id(id).await {
            Ok(Some(job)) => {
                if job.status.is_terminal() {
                    if job.status == target {
                        EngineError::Internal(format!("任务 {id} 已处于目标终态"))
                    } else {
                        EngineError::ConflictingOutcome {
                            id,
                            existing: job.status.as_str().to_string(),
                            requested: target.as_str().to_string(),
                        }
                    }
                } else {
                    EngineError::InvalidTransition {
                        id,
                        from: job.status.as_str().to_string(),
                        to: target.as_str().to_string(),
                    }
                }
            }
            Ok(None) => EngineError::JobNotFound { id },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self, new_job), fields(account_id = %new_job.account_id, kind = %new_job.kind.as_str()))]
    async fn enqueue(&self, new_job: &NewJob) -> EngineResult<Job> {
        let job = self
            .insert(new_job, false)
            .await?
            .ok_or_else(|| EngineError::Internal("入队未返回任务行".to_string()))?;
        debug!(job_id = job.id, "任务已入队");
        Ok(job)
    }

    async fn enqueue_if_absent(&self, new_job: &NewJob) -> EngineResult<Option<Job>> {
        self.insert(new_job, true).await
    }

    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        // SKIP LOCKED让多个认领方不互相阻塞也不重复认领
        let sql = format!(
            "UPDATE jobs SET status = 'PROCESSING' \
             WHERE id IN ( \
                 SELECT j.id FROM jobs j \
                 LEFT JOIN account_sessions s ON s.account_id = j.account_id \
                 WHERE j.status = 'PENDING' AND j.scheduled_at <= $1 \
                   AND (s.health IS NULL OR s.health <> 'BLOCKED') \
                 ORDER BY j.scheduled_at ASC, j.id ASC \
                 LIMIT $2 \
                 FOR UPDATE OF j SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(Self::row_to_job(row)?);
        }
        jobs.sort_by_key(|j| (j.scheduled_at, j.id));
        Ok(jobs)
    }

    #[instrument(skip(self, outcome), fields(job_id = id))]
    async fn complete(&self, id: i64, outcome: &JobOutcome) -> EngineResult<()> {
        let target = outcome.status();
        let (error_kind, error_message) = match outcome {
            JobOutcome::Failed(err) => (Some(err.kind.as_str()), Some(err.message.as_str())),
            _ => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                attempt_count = CASE
                    WHEN status = 'PROCESSING' AND $2 IN ('SUCCEEDED', 'FAILED')
                         AND attempt_count < max_attempts
                    THEN attempt_count + 1
                    ELSE attempt_count
                END,
                last_error_kind = $3,
                last_error_message = $4,
                completed_at = COALESCE(completed_at, $5)
            WHERE id = $1
              AND (status = 'PROCESSING' OR (status = 'PENDING' AND $2 = 'CANCELLED'))
            "#,
        )
        .bind(id)
        .bind(target)
        .bind(error_kind)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if let Some(job) = self.get_by_id(id).await? {
                if job.status == target {
                    return Ok(());
                }
            }
            return Err(self.classify_failed_transition(id, target).await);
        }
        debug!(status = target.as_str(), "任务已收敛到终态");
        Ok(())
    }

    async fn requeue(
        &self,
        id: i64,
        delay: chrono::Duration,
        last_error: &LastError,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'PENDING',
                attempt_count = attempt_count + 1,
                scheduled_at = $2,
                last_error_kind = $3,
                last_error_message = $4
            WHERE id = $1 AND status = 'PROCESSING' AND attempt_count < max_attempts
            "#,
        )
        .bind(id)
        .bind(Utc::now() + delay)
        .bind(last_error.kind)
        .bind(&last_error.message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_by_id(id).await? {
                Some(job) if job.status == JobStatus::Processing => {
                    Err(EngineError::AttemptsExhausted {
                        id,
                        attempts: job.attempt_count,
                        max_attempts: job.max_attempts,
                    })
                }
                Some(job) => Err(EngineError::InvalidTransition {
                    id,
                    from: job.status.as_str().to_string(),
                    to: JobStatus::Pending.as_str().to_string(),
                }),
                None => Err(EngineError::JobNotFound { id }),
            };
        }
        Ok(())
    }

    async fn release(&self, id: i64, delay: chrono::Duration) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'PENDING', scheduled_at = $2 \
             WHERE id = $1 AND status = 'PROCESSING'",
        )
        .bind(id)
        .bind(Utc::now() + delay)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_by_id(id).await? {
                Some(job) => Err(EngineError::InvalidTransition {
                    id,
                    from: job.status.as_str().to_string(),
                    to: JobStatus::Pending.as_str().to_string(),
                }),
                None => Err(EngineError::JobNotFound { id }),
            };
        }
        Ok(())
    }

    async fn record_reauth(&self, id: i64) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET reauth_count = reauth_count + 1 \
             WHERE id = $1 AND status = 'PROCESSING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_by_id(id).await? {
                Some(job) => Err(EngineError::InvalidTransition {
                    id,
                    from: job.status.as_str().to_string(),
                    to: job.status.as_str().to_string(),
                }),
                None => Err(EngineError::JobNotFound { id }),
            };
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = id))]
    async fn cancel(&self, id: i64) -> EngineResult<Job> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'CANCELLED', completed_at = $2 \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let marked = sqlx::query(
                "UPDATE jobs SET cancel_requested = TRUE \
                 WHERE id = $1 AND status = 'PROCESSING'",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;

            if marked.rows_affected() == 0 {
                return match self.get_by_id(id).await? {
                    Some(job) => Err(EngineError::InvalidTransition {
                        id,
                        from: job.status.as_str().to_string(),
                        to: JobStatus::Cancelled.as_str().to_string(),
                    }),
                    None => Err(EngineError::JobNotFound { id }),
                };
            }
        }

        self.get_by_id(id)
            .await?
            .ok_or(EngineError::JobNotFound { id })
    }

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1");
        let mut idx = 0;
        if filter.account_id.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND account_id = ${idx}"));
        }
        if filter.status.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND status = ${idx}"));
        }
        if filter.kind.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND kind = ${idx}"));
        }
        sql.push_str(&format!(
            " ORDER BY id DESC LIMIT ${} OFFSET ${}",
            idx + 1,
            idx + 2
        ));

        let mut query = sqlx::query(&sql);
        if let Some(account_id) = &filter.account_id {
            query = query.bind(account_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status);
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind);
        }
        let rows = query
            .bind(filter.limit.unwrap_or(100))
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(Self::row_to_job(row)?);
        }
        Ok(jobs)
    }

    async fn count(&self, filter: &JobFilter) -> EngineResult<i64> {
        let mut sql = "SELECT COUNT(*) as cnt FROM jobs WHERE 1=1".to_string();
        let mut idx = 0;
        if filter.account_id.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND account_id = ${idx}"));
        }
        if filter.status.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND status = ${idx}"));
        }
        if filter.kind.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND kind = ${idx}"));
        }

        let mut query = sqlx::query(&sql);
        if let Some(account_id) = &filter.account_id {
            query = query.bind(account_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status);
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get("cnt")?)
    }

    async fn get_processing(&self) -> EngineResult<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'PROCESSING'");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(Self::row_to_job(row)?);
        }
        Ok(jobs)
    }
}

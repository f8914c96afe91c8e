use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketpilot_core::EngineResult;
use marketpilot_domain::entities::ConcurrencyLease;
use marketpilot_domain::repositories::LeaseRepository;
use sqlx::{PgPool, Row};

pub struct PostgresLeaseRepository {
    pool: PgPool,
}

impl PostgresLeaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_lease(row: &sqlx::postgres::PgRow) -> EngineResult<ConcurrencyLease> {
        Ok(ConcurrencyLease {
            account_id: row.try_get("account_id")?,
            job_id: row.try_get("job_id")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl LeaseRepository for PostgresLeaseRepository {
    async fn try_acquire(
        &self,
        account_id: &str,
        job_id: i64,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        // 条件upsert：只有无租约或租约已过期才写入
        let result = sqlx::query(
            r#"
            INSERT INTO account_leases (account_id, job_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_id) DO UPDATE SET
                job_id = EXCLUDED.job_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE account_leases.expires_at <= EXCLUDED.acquired_at
            "#,
        )
        .bind(account_id)
        .bind(job_id)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, account_id: &str, job_id: i64) -> EngineResult<()> {
        sqlx::query("DELETE FROM account_leases WHERE account_id = $1 AND job_id = $2")
            .bind(account_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<ConcurrencyLease>> {
        let rows = sqlx::query(
            "DELETE FROM account_leases WHERE expires_at <= $1 \
             RETURNING account_id, job_id, acquired_at, expires_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            reclaimed.push(Self::row_to_lease(row)?);
        }
        Ok(reclaimed)
    }

    async fn get(&self, account_id: &str) -> EngineResult<Option<ConcurrencyLease>> {
        let row = sqlx::query(
            "SELECT account_id, job_id, acquired_at, expires_at \
             FROM account_leases WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_lease).transpose()
    }
}

pub mod postgres_job_repository;
pub mod postgres_lease_repository;
pub mod postgres_rule_repository;
pub mod postgres_session_repository;

pub use postgres_job_repository::PostgresJobRepository;
pub use postgres_lease_repository::PostgresLeaseRepository;
pub use postgres_rule_repository::PostgresRuleRepository;
pub use postgres_session_repository::PostgresSessionRepository;

use marketpilot_core::EngineResult;
use sqlx::PgPool;
use tracing::debug;

/// 建表与索引，幂等，可重复执行
pub async fn run_migrations(pool: &PgPool) -> EngineResult<()> {
    debug!("Running PostgreSQL migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            account_id VARCHAR(255) NOT NULL,
            kind VARCHAR(32) NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}',
            scheduled_at TIMESTAMPTZ NOT NULL,
            status VARCHAR(32) NOT NULL DEFAULT 'PENDING',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            reauth_count INTEGER NOT NULL DEFAULT 0,
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            last_error_kind VARCHAR(32),
            last_error_message TEXT,
            dedup_key VARCHAR(255) UNIQUE,
            created_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_sessions (
            account_id VARCHAR(255) PRIMARY KEY,
            health VARCHAR(32) NOT NULL DEFAULT 'ACTIVE',
            session_token TEXT NOT NULL,
            last_used_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_leases (
            account_id VARCHAR(255) PRIMARY KEY,
            job_id BIGINT NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS automation_rules (
            id BIGSERIAL PRIMARY KEY,
            account_id VARCHAR(255) NOT NULL,
            kind VARCHAR(32) NOT NULL,
            schedule VARCHAR(255) NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}',
            max_attempts INTEGER NOT NULL DEFAULT 3,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_jobs_status_scheduled_at ON jobs(status, scheduled_at)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_account_id ON jobs(account_id)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_kind ON jobs(kind)",
        "CREATE INDEX IF NOT EXISTS idx_leases_expires_at ON account_leases(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_rules_enabled ON automation_rules(enabled)",
    ];
    for index_sql in indexes {
        sqlx::query(index_sql).execute(pool).await?;
    }

    debug!("PostgreSQL migrations completed");
    Ok(())
}

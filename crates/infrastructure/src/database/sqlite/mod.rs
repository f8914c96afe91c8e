pub mod sqlite_job_repository;
pub mod sqlite_lease_repository;
pub mod sqlite_rule_repository;
pub mod sqlite_session_repository;

pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_lease_repository::SqliteLeaseRepository;
pub use sqlite_rule_repository::SqliteRuleRepository;
pub use sqlite_session_repository::SqliteSessionRepository;

use marketpilot_core::EngineResult;
use sqlx::SqlitePool;
use tracing::debug;

/// 建表与索引，幂等，可重复执行
pub async fn run_migrations(pool: &SqlitePool) -> EngineResult<()> {
    debug!("Running SQLite migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            scheduled_at DATETIME NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            reauth_count INTEGER NOT NULL DEFAULT 0,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            last_error_kind TEXT,
            last_error_message TEXT,
            dedup_key TEXT UNIQUE,
            created_at DATETIME NOT NULL,
            completed_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_sessions (
            account_id TEXT PRIMARY KEY,
            health TEXT NOT NULL DEFAULT 'ACTIVE',
            session_token TEXT NOT NULL,
            last_used_at DATETIME,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_leases (
            account_id TEXT PRIMARY KEY,
            job_id INTEGER NOT NULL,
            acquired_at DATETIME NOT NULL,
            expires_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS automation_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            schedule TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            max_attempts INTEGER NOT NULL DEFAULT 3,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at DATETIME NOT NULL
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

    debug!("SQLite migrations completed");
    Ok(())
}

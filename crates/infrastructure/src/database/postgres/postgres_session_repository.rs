use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketpilot_core::{EngineError, EngineResult};
use marketpilot_domain::entities::{AccountSession, SessionHealth};
use marketpilot_domain::repositories::SessionRepository;
use sqlx::{PgPool, Row};

pub struct PostgresSessionRepository {
    pool: PgPool,
}

impl PostgresSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_session(row: &sqlx::postgres::PgRow) -> EngineResult<AccountSession> {
        Ok(AccountSession {
            account_id: row.try_get("account_id")?,
            health: row.try_get("health")?,
            session_token: row.try_get("session_token")?,
            last_used_at: row.try_get("last_used_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn get(&self, account_id: &str) -> EngineResult<Option<AccountSession>> {
        let row = sqlx::query(
            "SELECT account_id, health, session_token, last_used_at, updated_at \
             FROM account_sessions WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn upsert(&self, session: &AccountSession) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO account_sessions (account_id, health, session_token, last_used_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id) DO UPDATE SET
                health = EXCLUDED.health,
                session_token = EXCLUDED.session_token,
                last_used_at = EXCLUDED.last_used_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&session.account_id)
        .bind(session.health)
        .bind(&session.session_token)
        .bind(session.last_used_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_health(&self, account_id: &str, health: SessionHealth) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE account_sessions SET health = $2, updated_at = $3 WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(health)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::SessionNotFound {
                account_id: account_id.to_string(),
            });
        }
        Ok(())
    }

    async fn renew_token(&self, account_id: &str, session_token: &str) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE account_sessions SET session_token = $2, health = 'ACTIVE', updated_at = $3 \
             WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(session_token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::SessionNotFound {
                account_id: account_id.to_string(),
            });
        }
        Ok(())
    }

    async fn touch_last_used(&self, account_id: &str, at: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE account_sessions SET last_used_at = $2 WHERE account_id = $1")
            .bind(account_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_by_health(&self, health: SessionHealth) -> EngineResult<Vec<AccountSession>> {
        let rows = sqlx::query(
            "SELECT account_id, health, session_token, last_used_at, updated_at \
             FROM account_sessions WHERE health = $1 ORDER BY account_id",
        )
        .bind(health)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            sessions.push(Self::row_to_session(row)?);
        }
        Ok(sessions)
    }
}

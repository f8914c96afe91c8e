use async_trait::async_trait;
use chrono::Utc;
use marketpilot_core::{EngineError, EngineResult};
use marketpilot_domain::entities::AutomationRule;
use marketpilot_domain::repositories::RuleRepository;
use sqlx::{Row, SqlitePool};

pub struct SqliteRuleRepository {
    pool: SqlitePool,
}

impl SqliteRuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> EngineResult<AutomationRule> {
        let payload_text: String = row.try_get("payload")?;
        let payload = serde_json::from_str(&payload_text)
            .map_err(|e| EngineError::Serialization(format!("payload 反序列化失败: {e}")))?;
        Ok(AutomationRule {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            kind: row.try_get("kind")?,
            schedule: row.try_get("schedule")?,
            payload,
            max_attempts: row.try_get("max_attempts")?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl RuleRepository for SqliteRuleRepository {
    async fn create(&self, rule: &AutomationRule) -> EngineResult<AutomationRule> {
        let payload_json = serde_json::to_string(&rule.payload)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO automation_rules (account_id, kind, schedule, payload, max_attempts, enabled, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING id, account_id, kind, schedule, payload, max_attempts, enabled, created_at
            "#,
        )
        .bind(&rule.account_id)
        .bind(rule.kind)
        .bind(&rule.schedule)
        .bind(payload_json)
        .bind(rule.max_attempts)
        .bind(rule.enabled)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_rule(&row)
    }

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<AutomationRule>> {
        let row = sqlx::query(
            "SELECT id, account_id, kind, schedule, payload, max_attempts, enabled, created_at \
             FROM automation_rules WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_rule).transpose()
    }

    async fn list_enabled(&self) -> EngineResult<Vec<AutomationRule>> {
        let rows = sqlx::query(
            "SELECT id, account_id, kind, schedule, payload, max_attempts, enabled, created_at \
             FROM automation_rules WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            rules.push(Self::row_to_rule(row)?);
        }
        Ok(rules)
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> EngineResult<()> {
        let result = sqlx::query("UPDATE automation_rules SET enabled = ?2 WHERE id = ?1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::RuleNotFound { id });
        }
        Ok(())
    }
}

//! Entity builders with sensible defaults for tests.

use chrono::{DateTime, Duration, Utc};
use marketpilot_domain::entities::{
    AccountSession, AutomationRule, Job, JobKind, JobStatus, LastError, SessionHealth,
};

/// Builder for `Job` instances.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: Job {
                id: 1,
                account_id: "acct-1".to_string(),
                kind: JobKind::Bump,
                payload: serde_json::json!({}),
                scheduled_at: Utc::now() - Duration::seconds(1),
                status: JobStatus::Pending,
                attempt_count: 0,
                max_attempts: 3,
                reauth_count: 0,
                cancel_requested: false,
                last_error: None,
                dedup_key: None,
                created_at: Utc::now(),
                completed_at: None,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.job.account_id = account_id.into();
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.job.kind = kind;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.job.payload = payload;
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.scheduled_at = at;
        self
    }

    /// Schedule the job in the future so it is not yet due.
    pub fn scheduled_in(mut self, delay: Duration) -> Self {
        self.job.scheduled_at = Utc::now() + delay;
        self
    }

    pub fn with_attempts(mut self, attempt_count: i32, max_attempts: i32) -> Self {
        self.job.attempt_count = attempt_count;
        self.job.max_attempts = max_attempts;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.job.dedup_key = Some(key.into());
        self
    }

    pub fn with_last_error(mut self, last_error: LastError) -> Self {
        self.job.last_error = Some(last_error);
        self
    }

    pub fn cancel_requested(mut self) -> Self {
        self.job.cancel_requested = true;
        self
    }

    pub fn processing(self) -> Self {
        self.with_status(JobStatus::Processing)
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `AccountSession` instances.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    session: AccountSession,
}

impl SessionBuilder {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            session: AccountSession::new(account_id, "test-token"),
        }
    }

    pub fn with_health(mut self, health: SessionHealth) -> Self {
        self.session.health = health;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.session.session_token = token.into();
        self
    }

    pub fn blocked(self) -> Self {
        self.with_health(SessionHealth::Blocked)
    }

    pub fn needs_reauth(self) -> Self {
        self.with_health(SessionHealth::NeedsReauth)
    }

    pub fn build(self) -> AccountSession {
        self.session
    }
}

/// Builder for `AutomationRule` instances.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    rule: AutomationRule,
}

impl RuleBuilder {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            rule: AutomationRule {
                id: 0,
                account_id: account_id.into(),
                kind: JobKind::Bump,
                // every 2 hours, cron crate syntax with leading seconds field
                schedule: "0 0 */2 * * *".to_string(),
                payload: serde_json::json!({}),
                max_attempts: 3,
                enabled: true,
                created_at: Utc::now(),
            },
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.rule.kind = kind;
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.rule.schedule = schedule.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.rule.payload = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.rule.enabled = false;
        self
    }

    pub fn build(self) -> AutomationRule {
        self.rule
    }
}

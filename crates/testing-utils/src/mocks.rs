//! In-memory repository implementations for testing.
//!
//! These honor the exact state-machine semantics of the SQL backends
//! (CAS-style claim, idempotent completion, attempt accounting) so the
//! engine logic can be tested without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketpilot_core::{EngineError, EngineResult};
use marketpilot_domain::entities::{
    AccountSession, AutomationRule, ConcurrencyLease, Job, JobFilter, JobOutcome, JobStatus,
    LastError, NewJob, SessionHealth,
};
use marketpilot_domain::repositories::{
    JobRepository, LeaseRepository, RuleRepository, SessionRepository,
};

/// In-memory session store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionRepository {
    sessions: Arc<Mutex<HashMap<String, AccountSession>>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: Vec<AccountSession>) -> Self {
        let map = sessions
            .into_iter()
            .map(|s| (s.account_id.clone(), s))
            .collect();
        Self {
            sessions: Arc::new(Mutex::new(map)),
        }
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn get(&self, account_id: &str) -> EngineResult<Option<AccountSession>> {
        Ok(self.sessions.lock().unwrap().get(account_id).cloned())
    }

    async fn upsert(&self, session: &AccountSession) -> EngineResult<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.account_id.clone(), session.clone());
        Ok(())
    }

    async fn update_health(&self, account_id: &str, health: SessionHealth) -> EngineResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(account_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                account_id: account_id.to_string(),
            })?;
        session.health = health;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn renew_token(&self, account_id: &str, session_token: &str) -> EngineResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(account_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                account_id: account_id.to_string(),
            })?;
        session.session_token = session_token.to_string();
        session.health = SessionHealth::Active;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_last_used(&self, account_id: &str, at: DateTime<Utc>) -> EngineResult<()> {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(account_id) {
            session.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn list_by_health(&self, health: SessionHealth) -> EngineResult<Vec<AccountSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.health == health)
            .cloned()
            .collect())
    }
}

/// In-memory job store.
///
/// Optionally linked to a session store so `claim_due` can exclude
/// blocked accounts exactly like the SQL implementation's join.
#[derive(Clone, Default)]
pub struct InMemoryJobRepository {
    jobs: Arc<Mutex<HashMap<i64, Job>>>,
    next_id: Arc<Mutex<i64>>,
    sessions: Option<InMemorySessionRepository>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
            sessions: None,
        }
    }

    /// Link a session store so blocked accounts are excluded from claims.
    pub fn with_session_store(mut self, sessions: InMemorySessionRepository) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn insert_job(&self, job: Job) {
        let mut next_id = self.next_id.lock().unwrap();
        if job.id >= *next_id {
            *next_id = job.id + 1;
        }
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn get_all(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    fn blocked_accounts(&self) -> Vec<String> {
        match &self.sessions {
            Some(store) => store
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.health == SessionHealth::Blocked)
                .map(|s| s.account_id.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn enqueue(&self, new_job: &NewJob) -> EngineResult<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(key) = &new_job.dedup_key {
            if jobs.values().any(|j| j.dedup_key.as_ref() == Some(key)) {
                return Err(EngineError::Internal(format!("dedup_key 冲突: {key}")));
            }
        }
        let mut next_id = self.next_id.lock().unwrap();
        let job = Job {
            id: *next_id,
            account_id: new_job.account_id.clone(),
            kind: new_job.kind,
            payload: new_job.payload.clone(),
            scheduled_at: new_job.scheduled_at,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: new_job.max_attempts,
            reauth_count: 0,
            cancel_requested: false,
            last_error: None,
            dedup_key: new_job.dedup_key.clone(),
            created_at: Utc::now(),
            completed_at: None,
        };
        *next_id += 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn enqueue_if_absent(&self, new_job: &NewJob) -> EngineResult<Option<Job>> {
        {
            let jobs = self.jobs.lock().unwrap();
            if let Some(key) = &new_job.dedup_key {
                if jobs.values().any(|j| j.dedup_key.as_ref() == Some(key)) {
                    return Ok(None);
                }
            }
        }
        self.enqueue(new_job).await.map(Some)
    }

    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        let blocked = self.blocked_accounts();
        let mut jobs = self.jobs.lock().unwrap();
        let mut due: Vec<i64> = jobs
            .values()
            .filter(|j| j.is_due(now) && !blocked.contains(&j.account_id))
            .map(|j| j.id)
            .collect();
        due.sort_by_key(|id| {
            let j = &jobs[id];
            (j.scheduled_at, j.id)
        });
        let mut claimed = Vec::new();
        for id in due.into_iter().take(limit as usize) {
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Processing;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: i64, outcome: &JobOutcome) -> EngineResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or(EngineError::JobNotFound { id })?;
        let target = outcome.status();

        if job.status.is_terminal() {
            // 相同结果的重复提交是no-op；冲突结果是错误
            if job.status == target {
                return Ok(());
            }
            return Err(EngineError::ConflictingOutcome {
                id,
                existing: job.status.as_str().to_string(),
                requested: target.as_str().to_string(),
            });
        }
        if !job.status.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                id,
                from: job.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }

        // 从processing收敛到成功/失败时记录刚刚结束的这次尝试
        if job.status == JobStatus::Processing
            && matches!(target, JobStatus::Succeeded | JobStatus::Failed)
            && job.attempt_count < job.max_attempts
        {
            job.attempt_count += 1;
        }
        job.status = target;
        // last_error 只属于失败终态，成功/取消时清掉重试留下的快照
        job.last_error = match outcome {
            JobOutcome::Failed(err) => Some(err.clone()),
            _ => None,
        };
        if job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn requeue(
        &self,
        id: i64,
        delay: chrono::Duration,
        last_error: &LastError,
    ) -> EngineResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or(EngineError::JobNotFound { id })?;
        if job.status != JobStatus::Processing {
            return Err(EngineError::InvalidTransition {
                id,
                from: job.status.as_str().to_string(),
                to: JobStatus::Pending.as_str().to_string(),
            });
        }
        if job.attempt_count >= job.max_attempts {
            return Err(EngineError::AttemptsExhausted {
                id,
                attempts: job.attempt_count,
                max_attempts: job.max_attempts,
            });
        }
        job.attempt_count += 1;
        job.status = JobStatus::Pending;
        job.scheduled_at = Utc::now() + delay;
        job.last_error = Some(last_error.clone());
        Ok(())
    }

    async fn release(&self, id: i64, delay: chrono::Duration) -> EngineResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or(EngineError::JobNotFound { id })?;
        if job.status != JobStatus::Processing {
            return Err(EngineError::InvalidTransition {
                id,
                from: job.status.as_str().to_string(),
                to: JobStatus::Pending.as_str().to_string(),
            });
        }
        job.status = JobStatus::Pending;
        job.scheduled_at = Utc::now() + delay;
        Ok(())
    }

    async fn record_reauth(&self, id: i64) -> EngineResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or(EngineError::JobNotFound { id })?;
        if job.status != JobStatus::Processing {
            return Err(EngineError::InvalidTransition {
                id,
                from: job.status.as_str().to_string(),
                to: job.status.as_str().to_string(),
            });
        }
        job.reauth_count += 1;
        Ok(())
    }

    async fn cancel(&self, id: i64) -> EngineResult<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or(EngineError::JobNotFound { id })?;
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
            }
            JobStatus::Processing => {
                job.cancel_requested = true;
            }
            _ => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: job.status.as_str().to_string(),
                    to: JobStatus::Cancelled.as_str().to_string(),
                });
            }
        }
        Ok(job.clone())
    }

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| {
                filter
                    .account_id
                    .as_ref()
                    .is_none_or(|a| &j.account_id == a)
                    && filter.status.is_none_or(|s| j.status == s)
                    && filter.kind.is_none_or(|k| j.kind == k)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|j| std::cmp::Reverse(j.id));
        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.unwrap_or(i64::MAX) as usize;
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, filter: &JobFilter) -> EngineResult<i64> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|j| {
                filter
                    .account_id
                    .as_ref()
                    .is_none_or(|a| &j.account_id == a)
                    && filter.status.is_none_or(|s| j.status == s)
                    && filter.kind.is_none_or(|k| j.kind == k)
            })
            .count() as i64)
    }

    async fn get_processing(&self) -> EngineResult<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .cloned()
            .collect())
    }
}

/// In-memory lease store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseRepository {
    leases: Arc<Mutex<HashMap<String, ConcurrencyLease>>>,
}

impl InMemoryLeaseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.leases
            .lock()
            .unwrap()
            .values()
            .filter(|l| !l.is_expired(now))
            .count()
    }
}

#[async_trait]
impl LeaseRepository for InMemoryLeaseRepository {
    async fn try_acquire(
        &self,
        account_id: &str,
        job_id: i64,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut leases = self.leases.lock().unwrap();
        if let Some(existing) = leases.get(account_id) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        leases.insert(
            account_id.to_string(),
            ConcurrencyLease {
                account_id: account_id.to_string(),
                job_id,
                acquired_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, account_id: &str, job_id: i64) -> EngineResult<()> {
        let mut leases = self.leases.lock().unwrap();
        if let Some(lease) = leases.get(account_id) {
            if lease.job_id == job_id {
                leases.remove(account_id);
            }
        }
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<ConcurrencyLease>> {
        let mut leases = self.leases.lock().unwrap();
        let expired: Vec<ConcurrencyLease> = leases
            .values()
            .filter(|l| l.is_expired(now))
            .cloned()
            .collect();
        for lease in &expired {
            leases.remove(&lease.account_id);
        }
        Ok(expired)
    }

    async fn get(&self, account_id: &str) -> EngineResult<Option<ConcurrencyLease>> {
        Ok(self.leases.lock().unwrap().get(account_id).cloned())
    }
}

/// In-memory automation rule store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuleRepository {
    rules: Arc<Mutex<HashMap<i64, AutomationRule>>>,
    next_id: Arc<Mutex<i64>>,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self {
            rules: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn create(&self, rule: &AutomationRule) -> EngineResult<AutomationRule> {
        let mut rules = self.rules.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();
        let mut new_rule = rule.clone();
        new_rule.id = *next_id;
        *next_id += 1;
        rules.insert(new_rule.id, new_rule.clone());
        Ok(new_rule)
    }

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<AutomationRule>> {
        Ok(self.rules.lock().unwrap().get(&id).cloned())
    }

    async fn list_enabled(&self) -> EngineResult<Vec<AutomationRule>> {
        let mut enabled: Vec<AutomationRule> = self
            .rules
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        enabled.sort_by_key(|r| r.id);
        Ok(enabled)
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> EngineResult<()> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .get_mut(&id)
            .ok_or(EngineError::RuleNotFound { id })?;
        rule.enabled = enabled;
        Ok(())
    }
}

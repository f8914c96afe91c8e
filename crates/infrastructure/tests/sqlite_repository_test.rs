//! SQLite仓储集成测试：状态机转换、认领竞争与租约语义

use std::sync::Arc;

use chrono::{Duration, Utc};
use marketpilot_core::EngineError;
use marketpilot_domain::entities::{
    FailureKind, JobFilter, JobKind, JobOutcome, JobStatus, LastError, NewJob, SessionHealth,
};
use marketpilot_domain::repositories::{
    JobRepository, LeaseRepository, RuleRepository, SessionRepository,
};
use marketpilot_infrastructure::database::sqlite::{
    self, SqliteJobRepository, SqliteLeaseRepository, SqliteRuleRepository,
    SqliteSessionRepository,
};
use marketpilot_testing_utils::{RuleBuilder, SessionBuilder};
use sqlx::SqlitePool;

async fn setup_pool() -> SqlitePool {
    // 内存库必须单连接，否则每个连接各自为库
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory sqlite");
    sqlite::run_migrations(&pool).await.expect("migrations failed");
    pool
}

fn new_job(account_id: &str) -> NewJob {
    NewJob::new(
        account_id,
        JobKind::Bump,
        serde_json::json!({"listing_id": 42}),
        Utc::now() - Duration::seconds(5),
    )
}

#[tokio::test]
async fn test_enqueue_and_get() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.payload["listing_id"], 42);

    let fetched = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.account_id, "acct-1");
    assert_eq!(fetched.kind, JobKind::Bump);
    assert!(fetched.completed_at.is_none());
}

#[tokio::test]
async fn test_enqueue_if_absent_skips_duplicate_dedup_key() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = new_job("acct-1").with_dedup_key("acct-1:BUMP:1788084000");
    let first = repo.enqueue_if_absent(&job).await.unwrap();
    assert!(first.is_some());

    let second = repo.enqueue_if_absent(&job).await.unwrap();
    assert!(second.is_none());

    let count = repo.count(&JobFilter::default()).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_claim_due_is_exclusive() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();

    let first = repo.claim_due(10, Utc::now()).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, job.id);
    assert_eq!(first[0].status, JobStatus::Processing);

    // 已认领的任务不会被再次认领
    let second = repo.claim_due(10, Utc::now()).await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_claim_due_skips_future_and_blocked_accounts() {
    let pool = setup_pool().await;
    let jobs = SqliteJobRepository::new(pool.clone());
    let sessions = SqliteSessionRepository::new(pool);

    sessions
        .upsert(&SessionBuilder::new("acct-blocked").blocked().build())
        .await
        .unwrap();

    let due = jobs.enqueue(&new_job("acct-1")).await.unwrap();
    jobs.enqueue(&new_job("acct-blocked")).await.unwrap();
    let mut future = new_job("acct-2");
    future.scheduled_at = Utc::now() + Duration::hours(1);
    jobs.enqueue(&future).await.unwrap();

    let claimed = jobs.claim_due(10, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due.id);
}

#[tokio::test]
async fn test_complete_is_idempotent_and_rejects_conflicts() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();
    repo.claim_due(1, Utc::now()).await.unwrap();

    repo.complete(job.id, &JobOutcome::Succeeded).await.unwrap();
    let done = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempt_count, 1);
    let completed_at = done.completed_at.unwrap();

    // 重复提交同一结果是no-op，completed_at不变
    repo.complete(job.id, &JobOutcome::Succeeded).await.unwrap();
    let again = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(again.completed_at.unwrap(), completed_at);

    // 终态后提交不同结果被拒绝
    let err = repo
        .complete(
            job.id,
            &JobOutcome::Failed(LastError::new(FailureKind::Transient, "boom")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConflictingOutcome { .. }));
}

#[tokio::test]
async fn test_requeue_increments_attempts_until_exhausted() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo
        .enqueue(&new_job("acct-1").with_max_attempts(2))
        .await
        .unwrap();
    let transient = LastError::new(FailureKind::Transient, "网络超时");

    repo.claim_due(1, Utc::now()).await.unwrap();
    repo.requeue(job.id, Duration::zero(), &transient)
        .await
        .unwrap();
    let after_first = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Pending);
    assert_eq!(after_first.attempt_count, 1);

    repo.claim_due(1, Utc::now()).await.unwrap();
    repo.requeue(job.id, Duration::zero(), &transient)
        .await
        .unwrap();

    repo.claim_due(1, Utc::now()).await.unwrap();
    let err = repo
        .requeue(job.id, Duration::zero(), &transient)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AttemptsExhausted {
            attempts: 2,
            max_attempts: 2,
            ..
        }
    ));
}

#[tokio::test]
async fn test_success_after_transient_retry_clears_last_error() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();
    repo.claim_due(1, Utc::now()).await.unwrap();
    repo.requeue(
        job.id,
        Duration::zero(),
        &LastError::new(FailureKind::Transient, "网络超时"),
    )
    .await
    .unwrap();
    let retried = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert!(retried.last_error.is_some());

    // 重试成功后不能再带着上一轮的失败快照
    repo.claim_due(1, Utc::now()).await.unwrap();
    repo.complete(job.id, &JobOutcome::Succeeded).await.unwrap();
    let succeeded = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(succeeded.status, JobStatus::Succeeded);
    assert!(succeeded.last_error.is_none());
}

#[tokio::test]
async fn test_release_does_not_touch_attempt_count() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();
    repo.claim_due(1, Utc::now()).await.unwrap();
    repo.release(job.id, Duration::seconds(5)).await.unwrap();

    let released = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(released.status, JobStatus::Pending);
    assert_eq!(released.attempt_count, 0);
    assert!(released.scheduled_at > Utc::now());
}

#[tokio::test]
async fn test_cancel_pending_is_immediate() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();
    let cancelled = repo.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    // 取消后不可再认领
    let claimed = repo.claim_due(10, Utc::now()).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn test_cancel_processing_sets_flag_only() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();
    repo.claim_due(1, Utc::now()).await.unwrap();

    let marked = repo.cancel(job.id).await.unwrap();
    assert_eq!(marked.status, JobStatus::Processing);
    assert!(marked.cancel_requested);

    // Worker随后收敛到cancelled
    repo.complete(job.id, &JobOutcome::Cancelled).await.unwrap();
    let done = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_terminal_job_is_rejected() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();
    repo.claim_due(1, Utc::now()).await.unwrap();
    repo.complete(job.id, &JobOutcome::Succeeded).await.unwrap();

    let err = repo.cancel(job.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_lease_exclusivity_and_expiry() {
    let pool = setup_pool().await;
    let leases = SqliteLeaseRepository::new(pool);
    let now = Utc::now();
    let ttl = Duration::seconds(300);

    assert!(leases.try_acquire("acct-1", 1, ttl, now).await.unwrap());
    // 活租约在手，其他任务拿不到
    assert!(!leases.try_acquire("acct-1", 2, ttl, now).await.unwrap());

    // 过期后可被接管
    let later = now + Duration::seconds(301);
    assert!(leases.try_acquire("acct-1", 2, ttl, later).await.unwrap());
    let lease = leases.get("acct-1").await.unwrap().unwrap();
    assert_eq!(lease.job_id, 2);
}

#[tokio::test]
async fn test_concurrent_lease_acquire_has_single_winner() {
    let pool = setup_pool().await;
    let leases = Arc::new(SqliteLeaseRepository::new(pool));
    let ttl = Duration::seconds(300);

    // 多任务同时抢同一账号的租约，只能有一个赢家
    let mut handles = Vec::new();
    for job_id in 1..=8i64 {
        let leases = Arc::clone(&leases);
        handles.push(tokio::spawn(async move {
            leases
                .try_acquire("acct-1", job_id, ttl, Utc::now())
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(leases.get("acct-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_claim_due_never_double_claims() {
    let pool = setup_pool().await;
    let repo = Arc::new(SqliteJobRepository::new(pool));
    let job = repo.enqueue(&new_job("acct-1")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = Arc::clone(&repo);
        handles.push(tokio::spawn(
            async move { repo.claim_due(1, Utc::now()).await.unwrap() },
        ));
    }
    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }
    // 条件更新保证同一行只被一个调用方改走
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, job.id);
    assert_eq!(claimed[0].status, JobStatus::Processing);
}

#[tokio::test]
async fn test_lease_release_requires_matching_job() {
    let pool = setup_pool().await;
    let leases = SqliteLeaseRepository::new(pool);
    let now = Utc::now();
    let ttl = Duration::seconds(300);

    leases.try_acquire("acct-1", 1, ttl, now).await.unwrap();

    // 非持有任务的释放是no-op
    leases.release("acct-1", 99).await.unwrap();
    assert!(leases.get("acct-1").await.unwrap().is_some());

    leases.release("acct-1", 1).await.unwrap();
    assert!(leases.get("acct-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reclaim_expired_leases() {
    let pool = setup_pool().await;
    let leases = SqliteLeaseRepository::new(pool);
    let now = Utc::now();

    leases
        .try_acquire("acct-1", 1, Duration::seconds(10), now)
        .await
        .unwrap();
    leases
        .try_acquire("acct-2", 2, Duration::seconds(600), now)
        .await
        .unwrap();

    let reclaimed = leases
        .reclaim_expired(now + Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].account_id, "acct-1");
    assert!(leases.get("acct-2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_session_renew_token_restores_active() {
    let pool = setup_pool().await;
    let sessions = SqliteSessionRepository::new(pool);

    sessions
        .upsert(&SessionBuilder::new("acct-1").needs_reauth().build())
        .await
        .unwrap();

    sessions.renew_token("acct-1", "fresh-token").await.unwrap();
    let session = sessions.get("acct-1").await.unwrap().unwrap();
    assert_eq!(session.health, SessionHealth::Active);
    assert_eq!(session.session_token, "fresh-token");

    let err = sessions
        .renew_token("acct-missing", "token")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionNotFound { .. }));
}

#[tokio::test]
async fn test_rule_crud_and_enable_toggle() {
    let pool = setup_pool().await;
    let rules = SqliteRuleRepository::new(pool);

    let created = rules
        .create(&RuleBuilder::new("acct-1").build())
        .await
        .unwrap();
    assert!(created.id > 0);

    let enabled = rules.list_enabled().await.unwrap();
    assert_eq!(enabled.len(), 1);

    rules.set_enabled(created.id, false).await.unwrap();
    assert!(rules.list_enabled().await.unwrap().is_empty());

    let err = rules.set_enabled(9999, true).await.unwrap_err();
    assert!(matches!(err, EngineError::RuleNotFound { id: 9999 }));
}

#[tokio::test]
async fn test_list_filters_by_status_and_account() {
    let pool = setup_pool().await;
    let repo = SqliteJobRepository::new(pool);

    repo.enqueue(&new_job("acct-1")).await.unwrap();
    repo.enqueue(&new_job("acct-2")).await.unwrap();
    let claimed = repo.claim_due(1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let pending = repo
        .list(&JobFilter {
            status: Some(JobStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let acct1 = repo
        .list(&JobFilter {
            account_id: Some("acct-1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(acct1.len(), 1);
    assert_eq!(acct1[0].account_id, "acct-1");
}

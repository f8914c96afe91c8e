//! 恢复服务测试:启动回退、租约回收与冷却解封

use std::sync::Arc;

use chrono::{Duration, Utc};
use marketpilot_core::config::{BlockedPolicy, SchedulerConfig, SessionConfig};
use marketpilot_dispatcher::RecoveryService;
use marketpilot_domain::entities::{JobStatus, SessionHealth};
use marketpilot_domain::repositories::{JobRepository, LeaseRepository, SessionRepository};
use marketpilot_testing_utils::{
    InMemoryJobRepository, InMemoryLeaseRepository, InMemorySessionRepository, JobBuilder,
    SessionBuilder,
};

fn build(
    jobs: &InMemoryJobRepository,
    leases: &InMemoryLeaseRepository,
    sessions: &InMemorySessionRepository,
    blocked_policy: BlockedPolicy,
) -> RecoveryService {
    RecoveryService::new(
        Arc::new(jobs.clone()),
        Arc::new(leases.clone()),
        Arc::new(sessions.clone()),
        SessionConfig { blocked_policy },
        &SchedulerConfig::default(),
    )
}

#[tokio::test]
async fn test_startup_releases_stranded_processing_jobs() {
    let jobs = InMemoryJobRepository::new();
    let leases = InMemoryLeaseRepository::new();
    let sessions = InMemorySessionRepository::new();

    jobs.insert_job(JobBuilder::new().with_id(1).processing().build());
    jobs.insert_job(JobBuilder::new().with_id(2).build());
    leases
        .try_acquire("acct-1", 1, Duration::seconds(300), Utc::now())
        .await
        .unwrap();

    let recovery = build(&jobs, &leases, &sessions, BlockedPolicy::Manual);
    let report = recovery.recover_on_startup().await.unwrap();

    assert_eq!(report.released_jobs, 1);
    let job = jobs.get_by_id(1).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    // 回退不计入尝试次数
    assert_eq!(job.attempt_count, 0);
    assert!(leases.get("acct-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lease_releases_its_job() {
    let jobs = InMemoryJobRepository::new();
    let leases = InMemoryLeaseRepository::new();
    let sessions = InMemorySessionRepository::new();
    let now = Utc::now();

    jobs.insert_job(JobBuilder::new().with_id(7).with_account("acct-1").processing().build());
    // 300秒TTL的租约在400秒前获取，已过期
    leases
        .try_acquire("acct-1", 7, Duration::seconds(300), now - Duration::seconds(400))
        .await
        .unwrap();

    let recovery = build(&jobs, &leases, &sessions, BlockedPolicy::Manual);
    let report = recovery.recover_once(now).await.unwrap();

    assert_eq!(report.reclaimed_leases, 1);
    assert_eq!(report.released_jobs, 1);
    assert_eq!(
        jobs.get_by_id(7).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn test_live_lease_is_untouched() {
    let jobs = InMemoryJobRepository::new();
    let leases = InMemoryLeaseRepository::new();
    let sessions = InMemorySessionRepository::new();
    let now = Utc::now();

    jobs.insert_job(JobBuilder::new().with_id(7).with_account("acct-1").processing().build());
    leases
        .try_acquire("acct-1", 7, Duration::seconds(300), now)
        .await
        .unwrap();

    let recovery = build(&jobs, &leases, &sessions, BlockedPolicy::Manual);
    let report = recovery.recover_once(now).await.unwrap();

    assert!(report.is_noop());
    assert_eq!(
        jobs.get_by_id(7).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
}

#[tokio::test]
async fn test_cooldown_policy_unblocks_expired_accounts() {
    let jobs = InMemoryJobRepository::new();
    let leases = InMemoryLeaseRepository::new();
    let sessions = InMemorySessionRepository::new();
    let now = Utc::now();

    let mut cooled = SessionBuilder::new("acct-cooled").blocked().build();
    cooled.updated_at = now - Duration::seconds(120);
    sessions.upsert(&cooled).await.unwrap();

    let mut fresh = SessionBuilder::new("acct-fresh").blocked().build();
    fresh.updated_at = now - Duration::seconds(10);
    sessions.upsert(&fresh).await.unwrap();

    let recovery = build(
        &jobs,
        &leases,
        &sessions,
        BlockedPolicy::Cooldown {
            cooldown_seconds: 60,
        },
    );
    let report = recovery.recover_once(now).await.unwrap();

    assert_eq!(report.unblocked_accounts, 1);
    assert_eq!(
        sessions.get("acct-cooled").await.unwrap().unwrap().health,
        SessionHealth::Active
    );
    assert_eq!(
        sessions.get("acct-fresh").await.unwrap().unwrap().health,
        SessionHealth::Blocked
    );
}

#[tokio::test]
async fn test_manual_policy_never_unblocks() {
    let jobs = InMemoryJobRepository::new();
    let leases = InMemoryLeaseRepository::new();
    let sessions = InMemorySessionRepository::new();
    let now = Utc::now();

    let mut cooled = SessionBuilder::new("acct-1").blocked().build();
    cooled.updated_at = now - Duration::days(1);
    sessions.upsert(&cooled).await.unwrap();

    let recovery = build(&jobs, &leases, &sessions, BlockedPolicy::Manual);
    let report = recovery.recover_once(now).await.unwrap();

    assert_eq!(report.unblocked_accounts, 0);
    assert_eq!(
        sessions.get("acct-1").await.unwrap().unwrap().health,
        SessionHealth::Blocked
    );
}

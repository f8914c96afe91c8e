//! 崩溃恢复：过期租约回收、滞留任务回退与冷却解封

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use marketpilot_core::config::{BlockedPolicy, SchedulerConfig, SessionConfig};
use marketpilot_core::EngineResult;
use marketpilot_domain::entities::{JobStatus, SessionHealth};
use marketpilot_domain::repositories::{JobRepository, LeaseRepository, SessionRepository};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 一轮恢复的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 回收的过期租约数
    pub reclaimed_leases: usize,
    /// 回退到pending的任务数
    pub released_jobs: usize,
    /// 冷却期满解封的账号数
    pub unblocked_accounts: usize,
}

impl RecoveryReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// 恢复服务
///
/// 租约过期视为持有方已崩溃：回收租约并把对应任务无罚回退。
/// 启动时所有processing任务都按崩溃遗留处理。
pub struct RecoveryService {
    jobs: Arc<dyn JobRepository>,
    leases: Arc<dyn LeaseRepository>,
    sessions: Arc<dyn SessionRepository>,
    session_config: SessionConfig,
    interval_seconds: u64,
}

impl RecoveryService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        leases: Arc<dyn LeaseRepository>,
        sessions: Arc<dyn SessionRepository>,
        session_config: SessionConfig,
        scheduler_config: &SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            leases,
            sessions,
            session_config,
            interval_seconds: scheduler_config.recovery_interval_seconds,
        }
    }

    /// 启动恢复：把上次进程遗留的processing任务全部回退
    pub async fn recover_on_startup(&self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let stranded = self.jobs.get_processing().await?;
        for job in &stranded {
            match self.jobs.release(job.id, Duration::zero()).await {
                Ok(()) => report.released_jobs += 1,
                Err(e) => error!(job_id = job.id, error = %e, "滞留任务回退失败"),
            }
            // 进程重启后内存租约已无意义，库里的也一并清掉
            if let Err(e) = self.leases.release(&job.account_id, job.id).await {
                error!(job_id = job.id, error = %e, "滞留租约清理失败");
            }
        }
        report.reclaimed_leases = self.leases.reclaim_expired(Utc::now()).await?.len();

        if !report.is_noop() {
            warn!(
                released = report.released_jobs,
                reclaimed = report.reclaimed_leases,
                "启动恢复完成，存在上次进程的遗留"
            );
        }
        Ok(report)
    }

    /// 周期恢复：回收过期租约，回退其持有的任务，处理冷却解封
    pub async fn recover_once(&self, now: DateTime<Utc>) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let reclaimed = self.leases.reclaim_expired(now).await?;
        report.reclaimed_leases = reclaimed.len();

        for lease in &reclaimed {
            match self.jobs.get_by_id(lease.job_id).await? {
                Some(job) if job.status == JobStatus::Processing => {
                    match self.jobs.release(job.id, Duration::zero()).await {
                        Ok(()) => {
                            warn!(
                                job_id = job.id,
                                account_id = %lease.account_id,
                                "租约过期，任务回退pending"
                            );
                            report.released_jobs += 1;
                        }
                        Err(e) => error!(job_id = job.id, error = %e, "租约过期任务回退失败"),
                    }
                }
                _ => {}
            }
        }

        report.unblocked_accounts = self.unblock_cooled_accounts(now).await?;
        Ok(report)
    }

    /// 冷却策略下，封禁满期的账号恢复active
    async fn unblock_cooled_accounts(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let cooldown_seconds = match self.session_config.blocked_policy {
            BlockedPolicy::Manual => return Ok(0),
            BlockedPolicy::Cooldown { cooldown_seconds } => cooldown_seconds,
        };

        let blocked = self.sessions.list_by_health(SessionHealth::Blocked).await?;
        let mut unblocked = 0;
        for session in &blocked {
            if session.updated_at + Duration::seconds(cooldown_seconds as i64) <= now {
                match self
                    .sessions
                    .update_health(&session.account_id, SessionHealth::Active)
                    .await
                {
                    Ok(()) => {
                        info!(account_id = %session.account_id, "冷却期满，账号解封");
                        unblocked += 1;
                    }
                    Err(e) => {
                        error!(account_id = %session.account_id, error = %e, "账号解封失败")
                    }
                }
            }
        }
        Ok(unblocked)
    }

    /// 恢复主循环
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.interval_seconds));
        info!(interval = self.interval_seconds, "恢复循环已启动");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.recover_once(Utc::now()).await {
                        error!(error = %e, "恢复扫描失败");
                    }
                }
                _ = shutdown.recv() => {
                    info!("恢复循环收到停机信号");
                    break;
                }
            }
        }
    }
}

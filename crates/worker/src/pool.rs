//! Worker池：有界通道消费、闸门准入、动作执行与结果落库

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use marketpilot_core::config::WorkerConfig;
use marketpilot_core::{EngineError, EngineResult};
use marketpilot_dispatcher::{AccountGate, GateDecision, RetryDecision, RetryPolicy};
use marketpilot_domain::entities::{
    AccountSession, FailureKind, Job, JobOutcome, LastError, SessionHealth,
};
use marketpilot_domain::events::JobFinishedEvent;
use marketpilot_domain::executor::{ExecutionOutcome, ExecutorRegistry};
use marketpilot_domain::repositories::{JobRepository, SessionRepository};
use marketpilot_infrastructure::WebhookNotifier;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Worker池
///
/// N个worker共享一个有界任务通道。每个任务走完整流水线：
/// 闸门准入 -> 硬超时执行 -> 重试决策 -> 状态落库 -> 租约释放 -> 事件通知。
pub struct WorkerPool {
    jobs: Arc<dyn JobRepository>,
    sessions: Arc<dyn SessionRepository>,
    gate: Arc<AccountGate>,
    registry: Arc<ExecutorRegistry>,
    retry_policy: RetryPolicy,
    notifier: Option<Arc<WebhookNotifier>>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        sessions: Arc<dyn SessionRepository>,
        gate: Arc<AccountGate>,
        registry: Arc<ExecutorRegistry>,
        retry_policy: RetryPolicy,
        notifier: Option<Arc<WebhookNotifier>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            sessions,
            gate,
            registry,
            retry_policy,
            notifier,
            config,
        }
    }

    /// 启动全部worker，返回各自的句柄
    pub fn spawn(
        self: Arc<Self>,
        job_rx: mpsc::Receiver<Job>,
        shutdown: broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut handles = Vec::with_capacity(self.config.worker_count);

        for worker_id in 0..self.config.worker_count {
            let pool = Arc::clone(&self);
            let job_rx = Arc::clone(&job_rx);
            let mut shutdown_rx = shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                info!(worker_id, "worker已启动");
                loop {
                    let job = tokio::select! {
                        job = async {
                            let mut rx = job_rx.lock().await;
                            rx.recv().await
                        } => job,
                        _ = shutdown_rx.recv() => {
                            info!(worker_id, "worker收到停机信号");
                            break;
                        }
                    };
                    let Some(job) = job else {
                        debug!(worker_id, "任务通道关闭，worker退出");
                        break;
                    };

                    let job_id = job.id;
                    if let Err(e) = pool.process_job(job).await {
                        error!(worker_id, job_id, error = %e, "任务处理失败");
                    }
                }
            }));
        }
        handles
    }

    /// 处理一个已认领（processing）的任务
    pub async fn process_job(&self, job: Job) -> EngineResult<()> {
        // 认领和执行之间可能到达取消请求
        if job.cancel_requested {
            self.jobs.complete(job.id, &JobOutcome::Cancelled).await?;
            self.notify_finished(job.id).await;
            return Ok(());
        }

        let release_delay = Duration::seconds(self.config.release_delay_seconds as i64);
        let session = match self.gate.admit(&job).await? {
            GateDecision::Admitted { session } => session,
            GateDecision::Busy | GateDecision::RateLimited => {
                // 无罚回退，稍后重新认领
                self.jobs.release(job.id, release_delay).await?;
                return Ok(());
            }
            GateDecision::SessionMissing => {
                let error = LastError::new(FailureKind::Permanent, "账号无会话记录");
                self.jobs
                    .complete(job.id, &JobOutcome::Failed(error))
                    .await?;
                self.notify_finished(job.id).await;
                return Ok(());
            }
            GateDecision::SessionUnhealthy { health } => {
                debug!(
                    job_id = job.id,
                    health = health.as_str(),
                    "会话不健康，任务回退"
                );
                self.jobs.release(job.id, release_delay).await?;
                return Ok(());
            }
        };

        // 此后持有租约，任何路径都必须释放
        let result = self.execute_and_settle(&job, &session).await;
        if let Err(e) = self.gate.release(&job).await {
            error!(job_id = job.id, error = %e, "租约释放失败");
        }
        result
    }

    async fn execute_and_settle(&self, job: &Job, session: &AccountSession) -> EngineResult<()> {
        let outcome = self.execute(job, session).await;
        self.sessions
            .touch_last_used(&job.account_id, Utc::now())
            .await?;

        // 重新读取任务：执行期间可能写入取消标记
        let refreshed = self
            .jobs
            .get_by_id(job.id)
            .await?
            .ok_or(EngineError::JobNotFound { id: job.id })?;

        match self.retry_policy.decide(&refreshed, &outcome) {
            RetryDecision::Complete(final_outcome) => {
                self.jobs.complete(job.id, &final_outcome).await?;
                self.notify_finished(job.id).await;
            }
            RetryDecision::RetryAfter { delay, error } => {
                match self.jobs.requeue(job.id, delay, &error).await {
                    Ok(()) => {
                        debug!(job_id = job.id, delay_seconds = delay.num_seconds(), "任务退避重试");
                    }
                    Err(EngineError::AttemptsExhausted { .. }) => {
                        // 决策与存储之间的竞态兜底
                        self.jobs
                            .complete(job.id, &JobOutcome::Failed(error))
                            .await?;
                        self.notify_finished(job.id).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            RetryDecision::Reauth { release_delay } => {
                warn!(job_id = job.id, account_id = %job.account_id, "会话过期，触发重新认证");
                self.jobs.record_reauth(job.id).await?;
                self.sessions
                    .update_health(&job.account_id, SessionHealth::NeedsReauth)
                    .await?;
                self.jobs.release(job.id, release_delay).await?;
            }
            RetryDecision::BlockAccount { error } => {
                warn!(account_id = %job.account_id, message = %error.message, "风控信号，账号熔断");
                self.sessions
                    .update_health(&job.account_id, SessionHealth::Blocked)
                    .await?;
                self.jobs
                    .complete(job.id, &JobOutcome::Failed(error))
                    .await?;
                self.notify_finished(job.id).await;
            }
        }
        Ok(())
    }

    /// 执行动作并施加硬超时，超时按瞬时失败处理
    async fn execute(&self, job: &Job, session: &AccountSession) -> ExecutionOutcome {
        let Some(executor) = self.registry.get(job.kind) else {
            return ExecutionOutcome::PermanentFailure(format!(
                "不支持的任务类型: {}",
                job.kind.as_str()
            ));
        };

        let timeout = StdDuration::from_secs(self.config.execute_timeout_seconds);
        match tokio::time::timeout(timeout, executor.execute(session, &job.payload)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                // 执行器的基础设施错误按瞬时失败重试
                ExecutionOutcome::Transient(format!("执行器错误: {e}"))
            }
            Err(_) => ExecutionOutcome::Transient(format!(
                "动作执行超过 {} 秒硬超时",
                self.config.execute_timeout_seconds
            )),
        }
    }

    async fn notify_finished(&self, job_id: i64) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        match self.jobs.get_by_id(job_id).await {
            Ok(Some(job)) => {
                if let Some(event) = JobFinishedEvent::from_job(&job) {
                    notifier.notify(event);
                }
            }
            Ok(None) => {}
            Err(e) => error!(job_id, error = %e, "读取终态任务失败，跳过通知"),
        }
    }
}

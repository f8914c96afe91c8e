//! 重试决策：把执行器的分类结果映射为任务存储上的下一步动作

use chrono::Duration;
use marketpilot_core::config::RetryConfig;
use marketpilot_domain::entities::{FailureKind, Job, JobOutcome, LastError};
use marketpilot_domain::executor::ExecutionOutcome;
use tracing::debug;

/// 一次执行结束后对任务的处置
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 收敛到终态（成功、失败或取消）
    Complete(JobOutcome),
    /// 退避后重试，计入 attempt_count
    RetryAfter { delay: Duration, error: LastError },
    /// 触发重新认证后无罚回退，计入 reauth_count
    Reauth { release_delay: Duration },
    /// 账号级熔断：封禁会话并标记任务失败
    BlockAccount { error: LastError },
}

/// 重试策略：指数退避+抖动，按失败类别分流
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 第 `attempt_count` 次失败后的重试间隔
    ///
    /// 指数退避封顶于 max_interval，叠加随机抖动避免雷群。
    pub fn backoff_delay(&self, attempt_count: i32) -> Duration {
        let base = self.config.base_interval_seconds as f64;
        let exponential = base * self.config.backoff_multiplier.powi(attempt_count);
        let capped = exponential.min(self.config.max_interval_seconds as f64);

        let jitter = capped * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped + jitter).max(base);

        Duration::seconds(final_interval as i64)
    }

    /// 对一次执行结果做出处置决策
    ///
    /// 取消优先于一切结果；瞬时失败在尝试耗尽后收敛为失败；
    /// 重新认证有独立的重试上限。
    pub fn decide(&self, job: &Job, outcome: &ExecutionOutcome) -> RetryDecision {
        if job.cancel_requested {
            return RetryDecision::Complete(JobOutcome::Cancelled);
        }

        match outcome {
            ExecutionOutcome::Success(_) => RetryDecision::Complete(JobOutcome::Succeeded),

            ExecutionOutcome::Transient(message) => {
                let error = LastError::new(FailureKind::Transient, message.clone());
                if job.attempt_count + 1 >= job.max_attempts {
                    debug!(
                        job_id = job.id,
                        attempts = job.attempt_count + 1,
                        "瞬时失败且尝试已耗尽"
                    );
                    RetryDecision::Complete(JobOutcome::Failed(error))
                } else {
                    RetryDecision::RetryAfter {
                        delay: self.backoff_delay(job.attempt_count),
                        error,
                    }
                }
            }

            ExecutionOutcome::NeedsReauth => {
                if job.reauth_count >= self.config.reauth_max_retries {
                    RetryDecision::Complete(JobOutcome::Failed(LastError::new(
                        FailureKind::Auth,
                        "会话重新认证次数已用尽",
                    )))
                } else {
                    RetryDecision::Reauth {
                        release_delay: Duration::seconds(
                            self.config.base_interval_seconds as i64,
                        ),
                    }
                }
            }

            ExecutionOutcome::Blocked(message) => RetryDecision::BlockAccount {
                error: LastError::new(FailureKind::Blocked, message.clone()),
            },

            ExecutionOutcome::PermanentFailure(message) => RetryDecision::Complete(
                JobOutcome::Failed(LastError::new(FailureKind::Permanent, message.clone())),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketpilot_testing_utils::JobBuilder;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_interval_seconds: 30,
            max_interval_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            default_max_attempts: 3,
            reauth_max_retries: 2,
        })
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(0), Duration::seconds(30));
        assert_eq!(policy.backoff_delay(1), Duration::seconds(60));
        assert_eq!(policy.backoff_delay(2), Duration::seconds(120));
        // 封顶于max_interval
        assert_eq!(policy.backoff_delay(20), Duration::seconds(3600));
    }

    #[test]
    fn test_transient_retries_then_fails() {
        let policy = policy();
        let outcome = ExecutionOutcome::Transient("超时".to_string());

        let fresh = JobBuilder::new().with_attempts(0, 3).build();
        assert!(matches!(
            policy.decide(&fresh, &outcome),
            RetryDecision::RetryAfter { .. }
        ));

        // 第三次瞬时失败收敛为失败
        let exhausted = JobBuilder::new().with_attempts(2, 3).build();
        match policy.decide(&exhausted, &outcome) {
            RetryDecision::Complete(JobOutcome::Failed(err)) => {
                assert_eq!(err.kind, FailureKind::Transient);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_reauth_has_independent_budget() {
        let policy = policy();
        let job = JobBuilder::new().with_attempts(2, 3).build();
        // attempt_count不影响reauth预算
        assert!(matches!(
            policy.decide(&job, &ExecutionOutcome::NeedsReauth),
            RetryDecision::Reauth { .. }
        ));

        let mut spent = JobBuilder::new().build();
        spent.reauth_count = 2;
        match policy.decide(&spent, &ExecutionOutcome::NeedsReauth) {
            RetryDecision::Complete(JobOutcome::Failed(err)) => {
                assert_eq!(err.kind, FailureKind::Auth);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_blocked_and_permanent_never_retry() {
        let policy = policy();
        let job = JobBuilder::new().build();

        assert!(matches!(
            policy.decide(&job, &ExecutionOutcome::Blocked("风控".to_string())),
            RetryDecision::BlockAccount { .. }
        ));
        assert!(matches!(
            policy.decide(
                &job,
                &ExecutionOutcome::PermanentFailure("载荷无效".to_string())
            ),
            RetryDecision::Complete(JobOutcome::Failed(_))
        ));
    }

    #[test]
    fn test_cancel_request_wins_over_outcome() {
        let policy = policy();
        let job = JobBuilder::new().cancel_requested().build();
        assert_eq!(
            policy.decide(&job, &ExecutionOutcome::Success(serde_json::json!({}))),
            RetryDecision::Complete(JobOutcome::Cancelled)
        );
    }
}

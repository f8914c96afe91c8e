//! 账号闸门：并发租约、会话健康与令牌桶限流的统一准入

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use marketpilot_core::config::{RateLimitConfig, WorkerConfig};
use marketpilot_core::EngineResult;
use marketpilot_domain::entities::{AccountSession, Job, SessionHealth};
use marketpilot_domain::repositories::{LeaseRepository, SessionRepository};
use tracing::debug;

/// 准入裁决
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// 放行，携带账号会话与已持有的租约
    Admitted { session: AccountSession },
    /// 同账号已有在途动作，无罚回退
    Busy,
    /// 令牌桶耗尽，无罚回退
    RateLimited,
    /// 账号无会话记录，任务无法执行
    SessionMissing,
    /// 会话不健康（封禁或待重新认证），无罚回退
    SessionUnhealthy { health: SessionHealth },
}

/// 平台级令牌桶限流器，所有worker共享同一个桶
///
/// 令牌以千分之一为单位存在单个原子里，CAS扣减；
/// 惰性补充：取令牌时按流逝时间折算新令牌，无后台任务。
pub struct RateLimiter {
    /// 容量，单位千分之一令牌
    capacity_milli: u64,
    refill_per_second: f64,
    started: Instant,
    tokens_milli: AtomicU64,
    last_refill_nanos: AtomicU64,
}

const MILLI: u64 = 1_000;

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity_milli = config.burst_capacity as u64 * MILLI;
        Self {
            capacity_milli,
            refill_per_second: config.actions_per_minute as f64 / 60.0,
            started: Instant::now(),
            tokens_milli: AtomicU64::new(capacity_milli),
            last_refill_nanos: AtomicU64::new(0),
        }
    }

    /// 尝试取走一个令牌
    pub fn try_take(&self) -> bool {
        self.refill();
        let mut current = self.tokens_milli.load(Ordering::Acquire);
        loop {
            if current < MILLI {
                return false;
            }
            match self.tokens_milli.compare_exchange_weak(
                current,
                current - MILLI,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn refill(&self) {
        let now_nanos = self.started.elapsed().as_nanos() as u64;
        let last = self.last_refill_nanos.load(Ordering::Acquire);
        let elapsed_secs = now_nanos.saturating_sub(last) as f64 / 1e9;
        let add_milli = (elapsed_secs * self.refill_per_second * MILLI as f64) as u64;
        if add_milli == 0 {
            // 不推进last_refill，让不足千分之一的零头继续累积
            return;
        }
        // CAS赢家负责补充，输家的流逝时间由下一轮折算
        if self
            .last_refill_nanos
            .compare_exchange(last, now_nanos, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut current = self.tokens_milli.load(Ordering::Acquire);
        loop {
            let next = (current + add_milli).min(self.capacity_milli);
            match self.tokens_milli.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// 账号闸门
///
/// 准入顺序：会话在场且健康 -> 令牌桶 -> 并发租约。
/// 租约最后获取，保证拒绝路径不留残余租约。
pub struct AccountGate {
    sessions: Arc<dyn SessionRepository>,
    leases: Arc<dyn LeaseRepository>,
    rate_limiter: RateLimiter,
    lease_ttl: Duration,
}

impl AccountGate {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        leases: Arc<dyn LeaseRepository>,
        rate_limit: &RateLimitConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            sessions,
            leases,
            rate_limiter: RateLimiter::new(rate_limit),
            lease_ttl: Duration::seconds(worker.lease_ttl_seconds as i64),
        }
    }

    /// 尝试放行一个已认领的任务
    pub async fn admit(&self, job: &Job) -> EngineResult<GateDecision> {
        let session = match self.sessions.get(&job.account_id).await? {
            Some(session) => session,
            None => {
                debug!(job_id = job.id, account_id = %job.account_id, "账号无会话");
                return Ok(GateDecision::SessionMissing);
            }
        };

        if session.health != SessionHealth::Active {
            return Ok(GateDecision::SessionUnhealthy {
                health: session.health,
            });
        }

        if !self.rate_limiter.try_take() {
            debug!(job_id = job.id, account_id = %job.account_id, "令牌桶耗尽");
            return Ok(GateDecision::RateLimited);
        }

        let acquired = self
            .leases
            .try_acquire(&job.account_id, job.id, self.lease_ttl, Utc::now())
            .await?;
        if !acquired {
            debug!(job_id = job.id, account_id = %job.account_id, "账号租约被占用");
            return Ok(GateDecision::Busy);
        }

        Ok(GateDecision::Admitted { session })
    }

    /// 释放任务持有的租约
    pub async fn release(&self, job: &Job) -> EngineResult<()> {
        self.leases.release(&job.account_id, job.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, per_minute: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            burst_capacity: burst,
            actions_per_minute: per_minute,
        })
    }

    #[test]
    fn test_burst_then_empty() {
        let limiter = limiter(3, 60);
        assert!(limiter.try_take());
        assert!(limiter.try_take());
        assert!(limiter.try_take());
        assert!(!limiter.try_take());
    }

    #[test]
    fn test_refill_restores_tokens() {
        // 每秒1000个令牌，睡10ms足够补回一个
        let limiter = limiter(1, 60_000);
        assert!(limiter.try_take());
        assert!(!limiter.try_take());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limiter.try_take());
    }

    #[test]
    fn test_bucket_is_shared_across_accounts() {
        let limiter = limiter(1, 60);
        assert!(limiter.try_take());
        // 平台级上限，与账号无关
        assert!(!limiter.try_take());
    }
}

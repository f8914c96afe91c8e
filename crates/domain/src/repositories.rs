//! 数据仓储层接口定义
//!
//! 持久化层的核心抽象，全部异步、`Send + Sync`，以 `Arc<dyn …>` 注入：
//! - `JobRepository` - 任务存储与状态机转换
//! - `SessionRepository` - 账号会话存储
//! - `LeaseRepository` - 账号并发租约
//! - `RuleRepository` - 循环自动化规则
//!
//! 接口与实现分离，支持 PostgreSQL / SQLite 两种后端以及测试用内存实现。
//! 所有状态转换都通过条件更新（CAS）实现，不跨I/O边界持锁。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketpilot_core::EngineResult;

use crate::entities::{
    AccountSession, AutomationRule, ConcurrencyLease, Job, JobFilter, JobOutcome, LastError,
    NewJob, SessionHealth,
};

/// 任务仓储接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 创建新任务，返回含数据库生成ID的任务
    ///
    /// `dedup_key` 冲突视为逻辑错误（仅规则展开使用 `enqueue_if_absent`）。
    async fn enqueue(&self, job: &NewJob) -> EngineResult<Job>;

    /// 幂等入队：`dedup_key` 已存在时静默跳过，返回None
    ///
    /// 循环规则展开使用，保证同一 (账号, 类型, 时间槽) 只物化一次。
    async fn enqueue_if_absent(&self, job: &NewJob) -> EngineResult<Option<Job>>;

    /// 原子认领到期任务
    ///
    /// 选出至多 `limit` 条 `status=pending ∧ scheduled_at <= now` 的任务，
    /// 按 `scheduled_at` 升序，通过条件更新转为 `processing` 并返回。
    /// 并发调用安全：同一任务绝不会被两个调用方同时认领。
    /// 会话 `health=blocked` 的账号被排除在外，任务保持pending。
    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> EngineResult<Vec<Job>>;

    /// 终态转换，幂等
    ///
    /// 对同一结果的第二次调用是no-op；终态后提交不同结果返回
    /// `ConflictingOutcome`。`completed_at` 恰好设置一次。
    async fn complete(&self, id: i64, outcome: &JobOutcome) -> EngineResult<()>;

    /// 重试回退：processing -> pending，`attempt_count += 1`
    ///
    /// `scheduled_at = now + delay`，同时记录失败快照。
    /// `attempt_count >= max_attempts` 时返回 `AttemptsExhausted`，
    /// 调用方应改为 `complete(failed)`。
    async fn requeue(
        &self,
        id: i64,
        delay: chrono::Duration,
        last_error: &LastError,
    ) -> EngineResult<()>;

    /// 无罚回退：processing -> pending，不动 attempt_count
    ///
    /// 租约冲突、限流、重新认证后重试以及崩溃恢复使用。
    async fn release(&self, id: i64, delay: chrono::Duration) -> EngineResult<()>;

    /// 重新认证计数 +1（不计入 attempt_count），任务须处于processing
    async fn record_reauth(&self, id: i64) -> EngineResult<()>;

    /// 取消任务
    ///
    /// pending立即转cancelled；processing仅设置协作取消标记，
    /// 由Worker在动作返回后收敛到cancelled；终态任务返回InvalidTransition。
    async fn cancel(&self, id: i64) -> EngineResult<Job>;

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<Job>>;

    async fn list(&self, filter: &JobFilter) -> EngineResult<Vec<Job>>;

    async fn count(&self, filter: &JobFilter) -> EngineResult<i64>;

    /// 处于processing状态的任务（恢复服务扫描用）
    async fn get_processing(&self) -> EngineResult<Vec<Job>>;
}

/// 账号会话仓储接口
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get(&self, account_id: &str) -> EngineResult<Option<AccountSession>>;

    /// 插入或整体更新会话；每账号至多一条
    async fn upsert(&self, session: &AccountSession) -> EngineResult<()>;

    async fn update_health(&self, account_id: &str, health: SessionHealth) -> EngineResult<()>;

    /// 写入新令牌并恢复 health=active（重新认证成功路径）
    async fn renew_token(&self, account_id: &str, session_token: &str) -> EngineResult<()>;

    async fn touch_last_used(&self, account_id: &str, at: DateTime<Utc>) -> EngineResult<()>;

    /// 指定健康状态的账号列表（封禁面板/冷却解封扫描用）
    async fn list_by_health(&self, health: SessionHealth) -> EngineResult<Vec<AccountSession>>;
}

/// 账号并发租约仓储接口
///
/// 不变量：每账号至多一条未过期租约。过期租约视为持有方已崩溃，可被回收。
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// 尝试获取租约
    ///
    /// 仅当该账号没有未过期租约时成功（条件插入/替换）；
    /// 已有活租约时返回 `Ok(false)`，不是错误。
    async fn try_acquire(
        &self,
        account_id: &str,
        job_id: i64,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// 释放租约；仅当前持有任务可释放（防止过期后被他人接管再误删）
    async fn release(&self, account_id: &str, job_id: i64) -> EngineResult<()>;

    /// 回收所有已过期的租约，返回被回收的租约（崩溃恢复路径）
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<ConcurrencyLease>>;

    async fn get(&self, account_id: &str) -> EngineResult<Option<ConcurrencyLease>>;
}

/// 循环自动化规则仓储接口
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create(&self, rule: &AutomationRule) -> EngineResult<AutomationRule>;

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<AutomationRule>>;

    async fn list_enabled(&self) -> EngineResult<Vec<AutomationRule>>;

    async fn set_enabled(&self, id: i64, enabled: bool) -> EngineResult<()>;
}

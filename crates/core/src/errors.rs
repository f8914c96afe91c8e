use thiserror::Error;

/// 引擎统一错误类型定义
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("账号会话未找到: {account_id}")]
    SessionNotFound { account_id: String },

    #[error("自动化规则未找到: {id}")]
    RuleNotFound { id: i64 },

    #[error("任务 {id} 重试次数已用尽 ({attempts}/{max_attempts})")]
    AttemptsExhausted {
        id: i64,
        attempts: i32,
        max_attempts: i32,
    },

    #[error("任务 {id} 状态转换非法: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: String,
    },

    #[error("任务 {id} 已终态，拒绝写入冲突结果: 已有 {existing}，请求 {requested}")]
    ConflictingOutcome {
        id: i64,
        existing: String,
        requested: String,
    },

    #[error("账号 {account_id} 已被风控封禁，拒绝派发")]
    AccountBlocked { account_id: String },

    #[error("账号 {account_id} 存在未过期的并发租约")]
    LeaseHeld { account_id: String },

    #[error("全局限流：当前无可用令牌")]
    RateLimited,

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("动作执行超时")]
    ExecutionTimeout,

    #[error("不支持的任务类型: {kind}")]
    UnsupportedKind { kind: String },

    #[error("无效的任务载荷: {0}")]
    InvalidPayload(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("Webhook投递错误: {0}")]
    WebhookDelivery(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

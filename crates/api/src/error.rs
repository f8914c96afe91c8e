use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use marketpilot_core::EngineError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("引擎错误: {0}")]
    Engine(#[from] EngineError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, error_type, suggestions) = match &self {
            ApiError::Engine(EngineError::JobNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("任务 {id} 不存在"),
                "JOB_NOT_FOUND",
                vec![
                    "请检查任务ID是否正确".to_string(),
                    "使用 GET /api/jobs 查看任务列表".to_string(),
                ],
            ),
            ApiError::Engine(EngineError::SessionNotFound { account_id }) => (
                StatusCode::NOT_FOUND,
                format!("账号 {account_id} 没有会话记录"),
                "SESSION_NOT_FOUND",
                vec!["先通过 PUT /api/accounts/{id}/session 注册会话".to_string()],
            ),
            ApiError::Engine(EngineError::RuleNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("自动化规则 {id} 不存在"),
                "RULE_NOT_FOUND",
                vec!["请检查规则ID是否正确".to_string()],
            ),
            ApiError::Engine(EngineError::InvalidTransition { id, from, to }) => (
                StatusCode::CONFLICT,
                format!("任务 {id} 不允许从 {from} 转换到 {to}"),
                "INVALID_TRANSITION",
                vec!["任务可能已经结束".to_string()],
            ),
            ApiError::Engine(EngineError::ConflictingOutcome {
                id,
                existing,
                requested,
            }) => (
                StatusCode::CONFLICT,
                format!("任务 {id} 已收敛为 {existing}，拒绝 {requested}"),
                "CONFLICTING_OUTCOME",
                vec![],
            ),
            ApiError::Engine(EngineError::AttemptsExhausted { id, .. }) => (
                StatusCode::CONFLICT,
                format!("任务 {id} 的重试次数已耗尽"),
                "ATTEMPTS_EXHAUSTED",
                vec![],
            ),
            ApiError::Engine(EngineError::InvalidCron { expr, message }) => (
                StatusCode::BAD_REQUEST,
                format!("CRON表达式 '{expr}' 无效: {message}"),
                "INVALID_CRON",
                vec!["表达式使用秒级字段在前的六段语法，如 '0 0 */2 * * *'".to_string()],
            ),
            ApiError::Engine(EngineError::InvalidPayload(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("载荷无效: {msg}"),
                "INVALID_PAYLOAD",
                vec![],
            ),
            ApiError::Engine(EngineError::UnsupportedKind { kind }) => (
                StatusCode::BAD_REQUEST,
                format!("不支持的任务类型: {kind}"),
                "UNSUPPORTED_KIND",
                vec![],
            ),
            ApiError::Engine(EngineError::AccountBlocked { account_id }) => (
                StatusCode::CONFLICT,
                format!("账号 {account_id} 处于封禁状态"),
                "ACCOUNT_BLOCKED",
                vec!["等待冷却解封或人工处理后重试".to_string()],
            ),
            ApiError::Engine(EngineError::RateLimited) => (
                StatusCode::TOO_MANY_REQUESTS,
                "触发账号限流".to_string(),
                "RATE_LIMITED",
                vec![],
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                msg.clone(),
                "BAD_REQUEST",
                vec![],
            ),
            ApiError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                format!("请求体解析失败: {e}"),
                "SERIALIZATION_ERROR",
                vec![],
            ),
            ApiError::Engine(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("内部错误: {e}"),
                "INTERNAL_ERROR",
                vec![],
            ),
        };

        let body = json!({
            "success": false,
            "error": error_message,
            "error_type": error_type,
            "suggestions": suggestions,
            "timestamp": chrono::Utc::now(),
        });

        (status, Json(body)).into_response()
    }
}

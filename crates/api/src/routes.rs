use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use marketpilot_domain::repositories::{JobRepository, RuleRepository, SessionRepository};

use crate::handlers::{
    accounts::{get_session, reauth_account, upsert_session},
    health::health_check,
    jobs::{cancel_job, create_job, get_job, list_jobs},
    rules::{create_rule, get_rule, set_rule_enabled},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub job_repo: Arc<dyn JobRepository>,
    pub session_repo: Arc<dyn SessionRepository>,
    pub rule_repo: Arc<dyn RuleRepository>,
    /// 请求未指定max_attempts时的默认值
    pub default_max_attempts: i32,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // 任务
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        // 循环自动化规则
        .route("/api/rules", post(create_rule))
        .route("/api/rules/{id}", get(get_rule))
        .route("/api/rules/{id}/enabled", post(set_rule_enabled))
        // 账号会话
        .route(
            "/api/accounts/{id}/session",
            get(get_session).put(upsert_session),
        )
        .route("/api/accounts/{id}/reauth", post(reauth_account))
        .with_state(state)
}

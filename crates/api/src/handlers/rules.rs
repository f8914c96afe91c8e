use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use marketpilot_dispatcher::RuleSchedule;
use marketpilot_domain::entities::{AutomationRule, JobKind};
use serde::Deserialize;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    response::{success, ApiResponse},
    routes::AppState,
};

/// 规则创建请求
#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub account_id: String,
    pub kind: JobKind,
    /// 秒级字段在前的六段CRON表达式
    pub schedule: String,
    pub payload: serde_json::Value,
    pub max_attempts: Option<i32>,
    pub enabled: Option<bool>,
}

/// 创建循环自动化规则
///
/// CRON表达式在入库前校验，无效表达式直接拒绝，
/// 避免调度器展开时才发现坏规则。
pub async fn create_rule(
    State(state): State<AppState>,
    Json(request): Json<CreateRuleRequest>,
) -> ApiResult<ApiResponse<AutomationRule>> {
    if request.account_id.trim().is_empty() {
        return Err(ApiError::BadRequest("account_id 不能为空".to_string()));
    }
    RuleSchedule::validate(&request.schedule)?;

    let rule = AutomationRule {
        id: 0,
        account_id: request.account_id,
        kind: request.kind,
        schedule: request.schedule,
        payload: request.payload,
        max_attempts: request.max_attempts.unwrap_or(state.default_max_attempts),
        enabled: request.enabled.unwrap_or(true),
        created_at: Utc::now(),
    };
    let created = state.rule_repo.create(&rule).await?;
    info!(
        rule_id = created.id,
        account_id = %created.account_id,
        schedule = %created.schedule,
        "API创建自动化规则"
    );
    Ok(success(created))
}

/// 查询单条规则
pub async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<AutomationRule>> {
    let rule = state
        .rule_repo
        .get_by_id(id)
        .await?
        .ok_or(marketpilot_core::EngineError::RuleNotFound { id })?;
    Ok(success(rule))
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

/// 启用/停用规则；停用只影响后续展开，已物化的任务不受影响
pub async fn set_rule_enabled(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<SetEnabledRequest>,
) -> ApiResult<ApiResponse<AutomationRule>> {
    state.rule_repo.set_enabled(id, request.enabled).await?;
    let rule = state
        .rule_repo
        .get_by_id(id)
        .await?
        .ok_or(marketpilot_core::EngineError::RuleNotFound { id })?;
    info!(rule_id = id, enabled = request.enabled, "API更新规则开关");
    Ok(success(rule))
}

use axum::{
    extract::{Path, State},
    Json,
};
use marketpilot_domain::entities::AccountSession;
use serde::Deserialize;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    response::{success, ApiResponse},
    routes::AppState,
};

/// 会话注册/更新请求
///
/// 令牌只写不读：响应中的会话永远不包含 `session_token`。
#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_token: String,
}

/// 查询账号会话（令牌字段被序列化层隐藏）
pub async fn get_session(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<ApiResponse<AccountSession>> {
    let session = state
        .session_repo
        .get(&account_id)
        .await?
        .ok_or(marketpilot_core::EngineError::SessionNotFound { account_id })?;
    Ok(success(session))
}

/// 注册或整体替换账号会话，health重置为active
pub async fn upsert_session(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(request): Json<SessionRequest>,
) -> ApiResult<ApiResponse<AccountSession>> {
    if request.session_token.trim().is_empty() {
        return Err(ApiError::BadRequest("session_token 不能为空".to_string()));
    }

    let session = AccountSession::new(account_id.clone(), request.session_token);
    state.session_repo.upsert(&session).await?;
    info!(account_id = %account_id, "API注册账号会话");
    Ok(success(session))
}

/// 重新认证：写入新令牌并恢复 health=active
pub async fn reauth_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(request): Json<SessionRequest>,
) -> ApiResult<ApiResponse<AccountSession>> {
    if request.session_token.trim().is_empty() {
        return Err(ApiError::BadRequest("session_token 不能为空".to_string()));
    }

    state
        .session_repo
        .renew_token(&account_id, &request.session_token)
        .await?;
    let session = state
        .session_repo
        .get(&account_id)
        .await?
        .ok_or(marketpilot_core::EngineError::SessionNotFound { account_id })?;
    info!(account_id = %session.account_id, "API重新认证成功");
    Ok(ApiResponse::success_with_message(session, "会话已恢复"))
}

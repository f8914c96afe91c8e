use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use marketpilot_domain::entities::{Job, JobFilter, JobKind, JobStatus, NewJob};
use serde::Deserialize;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    response::{success, ApiResponse, PaginatedResponse},
    routes::AppState,
};

/// 任务创建请求
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub account_id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    /// 缺省为立即执行
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub dedup_key: Option<String>,
}

/// 任务查询参数
#[derive(Debug, Deserialize)]
pub struct JobQueryParams {
    pub account_id: Option<String>,
    pub status: Option<String>,
    pub kind: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// 提交任务
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<ApiResponse<Job>> {
    if request.account_id.trim().is_empty() {
        return Err(ApiError::BadRequest("account_id 不能为空".to_string()));
    }

    let mut new_job = NewJob::new(
        request.account_id,
        request.kind,
        request.payload,
        request.scheduled_at.unwrap_or_else(Utc::now),
    );
    let max_attempts = request.max_attempts.unwrap_or(state.default_max_attempts);
    if max_attempts < 1 {
        return Err(ApiError::BadRequest("max_attempts 必须大于0".to_string()));
    }
    new_job = new_job.with_max_attempts(max_attempts);
    if let Some(dedup_key) = request.dedup_key {
        new_job = new_job.with_dedup_key(dedup_key);
    }

    let job = state.job_repo.enqueue(&new_job).await?;
    info!(job_id = job.id, account_id = %job.account_id, "API提交任务");
    Ok(success(job))
}

/// 查询单个任务
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<Job>> {
    let job = state
        .job_repo
        .get_by_id(id)
        .await?
        .ok_or(marketpilot_core::EngineError::JobNotFound { id })?;
    Ok(success(job))
}

/// 任务列表，支持按账号/状态/类型过滤
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobQueryParams>,
) -> ApiResult<ApiResponse<PaginatedResponse<Job>>> {
    let status = params
        .status
        .as_deref()
        .map(JobStatus::parse_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let kind = params
        .kind
        .as_deref()
        .map(JobKind::parse_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(20).clamp(1, 100);

    let filter = JobFilter {
        account_id: params.account_id,
        status,
        kind,
        limit: Some(page_size),
        offset: Some((page - 1) * page_size),
    };

    let items = state.job_repo.list(&filter).await?;
    let total = state.job_repo.count(&filter).await?;
    Ok(success(PaginatedResponse::new(items, total, page, page_size)))
}

/// 取消任务
///
/// pending立即取消；processing打协作取消标记，响应返回当前快照。
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApiResponse<Job>> {
    let job = state.job_repo.cancel(id).await?;
    info!(job_id = id, status = job.status.as_str(), "API取消任务");
    Ok(ApiResponse::success_with_message(
        job,
        "取消请求已受理",
    ))
}

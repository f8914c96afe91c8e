use axum::Json;
use serde_json::json;

/// 健康检查
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "marketpilot",
        "timestamp": chrono::Utc::now(),
    }))
}

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use marketpilot_api::{create_routes, AppState};
use marketpilot_domain::entities::JobStatus;
use marketpilot_domain::repositories::SessionRepository;
use marketpilot_testing_utils::builders::{JobBuilder, SessionBuilder};
use marketpilot_testing_utils::mocks::{
    InMemoryJobRepository, InMemoryRuleRepository, InMemorySessionRepository,
};

struct TestApp {
    app: Router,
    jobs: InMemoryJobRepository,
    sessions: InMemorySessionRepository,
}

fn test_app() -> TestApp {
    test_app_with_default_attempts(3)
}

fn test_app_with_default_attempts(default_max_attempts: i32) -> TestApp {
    let jobs = InMemoryJobRepository::new();
    let sessions = InMemorySessionRepository::new();
    let rules = InMemoryRuleRepository::new();
    let state = AppState {
        job_repo: Arc::new(jobs.clone()),
        session_repo: Arc::new(sessions.clone()),
        rule_repo: Arc::new(rules),
        default_max_attempts,
    };
    TestApp {
        app: create_routes(state),
        jobs,
        sessions,
    }
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let t = test_app();

    let response = t
        .app
        .oneshot(empty_request(Method::GET, "/health"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "marketpilot");
}

#[tokio::test]
async fn test_create_job() {
    let t = test_app();

    let request = json_request(
        Method::POST,
        "/api/jobs",
        json!({
            "account_id": "acct-1",
            "kind": "PUBLISH",
            "payload": {"listing_id": 42},
        }),
    );
    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert!(json["success"].as_bool().unwrap());
    let data = &json["data"];
    assert_eq!(data["account_id"], "acct-1");
    assert_eq!(data["kind"], "PUBLISH");
    assert_eq!(data["status"], "PENDING");
    assert_eq!(data["attempt_count"], 0);
    assert_eq!(t.jobs.get_all().len(), 1);
}

#[tokio::test]
async fn test_create_job_uses_configured_default_max_attempts() {
    let t = test_app_with_default_attempts(5);

    let request = json_request(
        Method::POST,
        "/api/jobs",
        json!({
            "account_id": "acct-1",
            "kind": "BUMP",
            "payload": {},
        }),
    );
    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["data"]["max_attempts"], 5);
}

#[tokio::test]
async fn test_create_job_rejects_empty_account() {
    let t = test_app();

    let request = json_request(
        Method::POST,
        "/api/jobs",
        json!({
            "account_id": "  ",
            "kind": "BUMP",
            "payload": {},
        }),
    );
    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = read_json(response).await;
    assert!(!json["success"].as_bool().unwrap());
    assert_eq!(json["error_type"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_get_missing_job_returns_404() {
    let t = test_app();

    let response = t
        .app
        .oneshot(empty_request(Method::GET, "/api/jobs/999"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = read_json(response).await;
    assert_eq!(json["error_type"], "JOB_NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let t = test_app();
    t.jobs.insert_job(JobBuilder::new().with_id(7).build());

    let response = t
        .app
        .oneshot(empty_request(Method::POST, "/api/jobs/7/cancel"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["data"]["status"], "CANCELLED");
}

#[tokio::test]
async fn test_cancel_processing_job_sets_flag() {
    let t = test_app();
    t.jobs
        .insert_job(JobBuilder::new().with_id(8).processing().build());

    let response = t
        .app
        .oneshot(empty_request(Method::POST, "/api/jobs/8/cancel"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    // 在途任务只打标记，由Worker收敛
    assert_eq!(json["data"]["status"], "PROCESSING");
    assert!(json["data"]["cancel_requested"].as_bool().unwrap());
}

#[tokio::test]
async fn test_cancel_terminal_job_conflicts() {
    let t = test_app();
    t.jobs.insert_job(
        JobBuilder::new()
            .with_id(9)
            .with_status(JobStatus::Succeeded)
            .build(),
    );

    let response = t
        .app
        .oneshot(empty_request(Method::POST, "/api/jobs/9/cancel"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = read_json(response).await;
    assert_eq!(json["error_type"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn test_list_jobs_filters_and_paginates() {
    let t = test_app();
    for i in 1..=5 {
        t.jobs
            .insert_job(JobBuilder::new().with_id(i).with_account("acct-1").build());
    }
    t.jobs.insert_job(
        JobBuilder::new()
            .with_id(6)
            .with_account("acct-2")
            .with_status(JobStatus::Succeeded)
            .build(),
    );

    let response = t
        .app
        .clone()
        .oneshot(empty_request(
            Method::GET,
            "/api/jobs?account_id=acct-1&status=PENDING&page=1&page_size=2",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    let data = &json["data"];
    assert_eq!(data["items"].as_array().unwrap().len(), 2);
    assert_eq!(data["total"], 5);
    assert_eq!(data["total_pages"], 3);

    // 非法状态值直接拒绝
    let response = t
        .app
        .oneshot(empty_request(Method::GET, "/api/jobs?status=RUNNING"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_rule_rejects_invalid_cron() {
    let t = test_app();

    let request = json_request(
        Method::POST,
        "/api/rules",
        json!({
            "account_id": "acct-1",
            "kind": "BUMP",
            "schedule": "not a cron",
            "payload": {},
        }),
    );
    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = read_json(response).await;
    assert_eq!(json["error_type"], "INVALID_CRON");
}

#[tokio::test]
async fn test_rule_lifecycle() {
    let t = test_app();

    let request = json_request(
        Method::POST,
        "/api/rules",
        json!({
            "account_id": "acct-1",
            "kind": "BUMP",
            "schedule": "0 0 */2 * * *",
            "payload": {"listing_id": 1},
        }),
    );
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    let rule_id = json["data"]["id"].as_i64().unwrap();
    assert!(json["data"]["enabled"].as_bool().unwrap());

    let request = json_request(
        Method::POST,
        &format!("/api/rules/{rule_id}/enabled"),
        json!({"enabled": false}),
    );
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t
        .app
        .oneshot(empty_request(
            Method::GET,
            &format!("/api/rules/{rule_id}"),
        ))
        .await
        .unwrap();
    let json = read_json(response).await;
    assert!(!json["data"]["enabled"].as_bool().unwrap());
}

#[tokio::test]
async fn test_session_token_never_serialized() {
    let t = test_app();

    let request = json_request(
        Method::PUT,
        "/api/accounts/acct-1/session",
        json!({"session_token": "tok-secret"}),
    );
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t
        .app
        .oneshot(empty_request(Method::GET, "/api/accounts/acct-1/session"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["data"]["account_id"], "acct-1");
    assert_eq!(json["data"]["health"], "ACTIVE");
    assert!(json["data"].get("session_token").is_none());
}

#[tokio::test]
async fn test_get_missing_session_returns_404() {
    let t = test_app();

    let response = t
        .app
        .oneshot(empty_request(Method::GET, "/api/accounts/ghost/session"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = read_json(response).await;
    assert_eq!(json["error_type"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_reauth_restores_health() {
    let t = test_app();
    t.sessions
        .upsert(&SessionBuilder::new("acct-1").needs_reauth().build())
        .await
        .unwrap();

    let request = json_request(
        Method::POST,
        "/api/accounts/acct-1/reauth",
        json!({"session_token": "tok-fresh"}),
    );
    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["data"]["health"], "ACTIVE");

    let session = t.sessions.get("acct-1").await.unwrap().unwrap();
    assert_eq!(session.session_token, "tok-fresh");
}

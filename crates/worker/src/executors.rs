//! 桥接执行器：把抽象动作转发给外部浏览器自动化服务
//!
//! 具体市场的DOM脚本运行在引擎之外（Chrome扩展/无头浏览器服务）。
//! 引擎侧只负责把 (会话, 动作, 载荷) POST给桥接端点，并把HTTP层的
//! 结果归类为 `ExecutionOutcome`。

use std::time::Duration;

use async_trait::async_trait;
use marketpilot_core::{config::ExecutorConfig, EngineResult};
use marketpilot_domain::entities::{AccountSession, JobKind};
use marketpilot_domain::executor::{ActionExecutor, ExecutionOutcome, ExecutorRegistry};
use serde_json::json;
use tracing::{debug, warn};

/// HTTP桥接执行器，每个任务类型注册一个实例
pub struct BridgeExecutor {
    kind: JobKind,
    client: reqwest::Client,
    endpoint: String,
}

impl BridgeExecutor {
    pub fn new(kind: JobKind, bridge_url: &str, request_timeout: Duration) -> Self {
        Self {
            kind,
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            endpoint: bridge_url.to_string(),
        }
    }

    /// 按HTTP状态码归类桥接服务的响应
    ///
    /// 401 -> 会话失效；403/429 -> 风控信号；4xx其余 -> 载荷问题；
    /// 5xx与网络故障 -> 瞬时失败。
    async fn classify_response(&self, response: reqwest::Response) -> ExecutionOutcome {
        let status = response.status();
        if status.is_success() {
            return match response.json::<serde_json::Value>().await {
                Ok(body) => ExecutionOutcome::Success(body),
                Err(e) => {
                    warn!(kind = self.kind.as_str(), error = %e, "桥接响应不是合法JSON");
                    ExecutionOutcome::Transient(format!("桥接响应解析失败: {e}"))
                }
            };
        }

        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 => ExecutionOutcome::NeedsReauth,
            403 | 429 => ExecutionOutcome::Blocked(format!("桥接服务返回 {status}: {body}")),
            400..=499 => {
                ExecutionOutcome::PermanentFailure(format!("桥接服务拒绝请求 {status}: {body}"))
            }
            _ => ExecutionOutcome::Transient(format!("桥接服务异常 {status}: {body}")),
        }
    }
}

#[async_trait]
impl ActionExecutor for BridgeExecutor {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(
        &self,
        session: &AccountSession,
        payload: &serde_json::Value,
    ) -> EngineResult<ExecutionOutcome> {
        debug!(
            kind = self.kind.as_str(),
            account_id = %session.account_id,
            "转发动作到桥接服务"
        );

        let request = json!({
            "account_id": session.account_id,
            "kind": self.kind.as_str(),
            "session_token": session.session_token,
            "payload": payload,
        });

        match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(response) => Ok(self.classify_response(response).await),
            Err(e) if e.is_timeout() => {
                Ok(ExecutionOutcome::Transient(format!("桥接请求超时: {e}")))
            }
            Err(e) => Ok(ExecutionOutcome::Transient(format!("桥接请求失败: {e}"))),
        }
    }
}

/// 根据配置组装执行器注册表
///
/// 未配置桥接地址时返回空注册表：任务会以"不支持的任务类型"落败，
/// 而不是静默堆积。
pub fn registry_from_config(config: &ExecutorConfig) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    let Some(bridge_url) = &config.bridge_url else {
        warn!("未配置 executor.bridge_url，不注册任何动作执行器");
        return registry;
    };

    let timeout = Duration::from_secs(config.request_timeout_seconds);
    for kind in [
        JobKind::Publish,
        JobKind::Bump,
        JobKind::Follow,
        JobKind::Reply,
    ] {
        registry.register(std::sync::Arc::new(BridgeExecutor::new(
            kind, bridge_url, timeout,
        )));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_empty_without_bridge_url() {
        let registry = registry_from_config(&ExecutorConfig::default());
        assert!(registry.supported_kinds().is_empty());
    }

    #[test]
    fn test_registry_covers_all_kinds() {
        let config = ExecutorConfig {
            bridge_url: Some("http://127.0.0.1:9700/actions".to_string()),
            request_timeout_seconds: 30,
        };
        let registry = registry_from_config(&config);
        let mut kinds = registry.supported_kinds();
        kinds.sort_by_key(|k| k.as_str());
        assert_eq!(
            kinds,
            vec![
                JobKind::Bump,
                JobKind::Follow,
                JobKind::Publish,
                JobKind::Reply
            ]
        );
    }
}

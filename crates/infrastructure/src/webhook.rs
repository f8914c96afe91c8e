//! Webhook通知投递：任务终态事件推送给订阅方
//!
//! 至少一次语义：投递失败重试有限次后放弃并计数，绝不阻塞任务流水线。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marketpilot_core::config::WebhookConfig;
use marketpilot_domain::events::JobFinishedEvent;
use tracing::{debug, warn};

/// 单个订阅方的投递统计快照
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WebhookStats {
    pub url: String,
    pub delivery_count: u64,
    pub failure_count: u64,
}

struct Subscriber {
    url: String,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

/// Webhook通知器
///
/// `notify` 同步返回，实际投递在后台任务完成；
/// 订阅方需按 (job_id, status) 去重。投递计数按订阅方分别累计。
pub struct WebhookNotifier {
    client: reqwest::Client,
    subscribers: Vec<Subscriber>,
    max_retries: u32,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delivery_timeout_seconds))
            .build()
            .unwrap_or_default();
        let subscribers = config
            .subscribers
            .iter()
            .map(|url| Subscriber {
                url: url.clone(),
                delivered: Arc::new(AtomicU64::new(0)),
                failed: Arc::new(AtomicU64::new(0)),
            })
            .collect();
        Self {
            client,
            subscribers,
            max_retries: config.delivery_max_retries,
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// 每个订阅方各自的投递统计
    pub fn stats(&self) -> Vec<WebhookStats> {
        self.subscribers
            .iter()
            .map(|s| WebhookStats {
                url: s.url.clone(),
                delivery_count: s.delivered.load(Ordering::Relaxed),
                failure_count: s.failed.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// 异步投递给全部订阅方，不等待结果
    pub fn notify(&self, event: JobFinishedEvent) {
        for subscriber in &self.subscribers {
            let client = self.client.clone();
            let url = subscriber.url.clone();
            let event = event.clone();
            let max_retries = self.max_retries;
            let delivered = Arc::clone(&subscriber.delivered);
            let failed = Arc::clone(&subscriber.failed);

            tokio::spawn(async move {
                let mut attempt = 0u32;
                loop {
                    let result = client.post(&url).json(&event).send().await;
                    match result {
                        Ok(resp) if resp.status().is_success() => {
                            delivered.fetch_add(1, Ordering::Relaxed);
                            debug!(job_id = event.job_id, %url, "webhook已投递");
                            return;
                        }
                        Ok(resp) => {
                            warn!(
                                job_id = event.job_id,
                                %url,
                                status = %resp.status(),
                                attempt,
                                "webhook投递被拒绝"
                            );
                        }
                        Err(e) => {
                            warn!(job_id = event.job_id, %url, attempt, error = %e, "webhook投递失败");
                        }
                    }
                    attempt += 1;
                    if attempt > max_retries {
                        failed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1 << attempt.min(5))).await;
                }
            });
        }
    }
}

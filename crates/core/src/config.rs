use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// 应用配置
///
/// 从TOML配置文件加载，环境变量（`MP__` 前缀，`__` 分隔）可覆盖任意字段，
/// 例如 `MP__DATABASE__URL`。所有字段都有默认值，允许零配置启动。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub executor: ExecutorConfig,
    pub webhook: WebhookConfig,
    pub api: ApiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            executor: ExecutorConfig::default(),
            webhook: WebhookConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 调度循环间隔（秒）
    pub tick_interval_seconds: u64,
    /// 每次tick最多认领的任务数
    pub claim_batch_limit: i64,
    /// 循环规则向前展开的时间窗口（秒）
    pub rule_lookahead_seconds: i64,
    /// 恢复扫描间隔（秒）
    pub recovery_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 10,
            claim_batch_limit: 50,
            rule_lookahead_seconds: 60,
            recovery_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 并发Worker数量，与账号数量无关
    pub worker_count: usize,
    /// 任务通道容量
    pub queue_capacity: usize,
    /// 单次动作执行硬超时（秒）
    pub execute_timeout_seconds: u64,
    /// 并发租约TTL（秒），必须大于执行超时
    pub lease_ttl_seconds: i64,
    /// 租约冲突/限流时回退到pending的延迟（秒）
    pub release_delay_seconds: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            execute_timeout_seconds: 120,
            lease_ttl_seconds: 300,
            release_delay_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 令牌桶容量
    pub burst_capacity: u32,
    /// 每分钟补充的令牌数（全平台动作上限，反风控阈值）
    pub actions_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 10,
            actions_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 基础退避间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大退避间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动系数（0.0-1.0）
    pub jitter_factor: f64,
    /// 默认最大尝试次数（任务未指定时）
    pub default_max_attempts: i32,
    /// 重新认证的重试上限（不计入 attempt_count）
    pub reauth_max_retries: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 30,
            max_interval_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            default_max_attempts: 3,
            reauth_max_retries: 2,
        }
    }
}

/// 封禁账号的处置策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BlockedPolicy {
    /// 人工解封（默认，更安全）
    Manual,
    /// 冷却期后由恢复服务自动解封
    Cooldown { cooldown_seconds: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub blocked_policy: BlockedPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            blocked_policy: BlockedPolicy::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 浏览器自动化桥接服务地址；未配置时引擎不注册任何执行器
    pub bridge_url: Option<String>,
    /// 桥接请求超时（秒），应小于Worker的执行硬超时
    pub request_timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            bridge_url: None,
            request_timeout_seconds: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// 终态事件的订阅方URL列表
    pub subscribers: Vec<String>,
    /// 单次投递超时（秒）
    pub delivery_timeout_seconds: u64,
    /// 投递失败的独立重试次数（与任务重试无关）
    pub delivery_max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            delivery_timeout_seconds: 10,
            delivery_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
        }
    }
}

impl AppConfig {
    /// 加载配置：TOML文件 + 环境变量覆盖
    pub fn load(config_path: Option<&str>) -> EngineResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(EngineError::Configuration(format!(
                    "配置文件不存在: {path}"
                )));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            for path in ["config/marketpilot.toml", "marketpilot.toml"] {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        let config = builder
            .add_source(Environment::with_prefix("MP").separator("__"))
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(|e| EngineError::Configuration(format!("配置解析失败: {e}")))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// 校验配置的内部一致性
    pub fn validate(&self) -> EngineResult<()> {
        if self.worker.worker_count == 0 {
            return Err(EngineError::Configuration(
                "worker.worker_count 必须大于0".to_string(),
            ));
        }
        if self.worker.lease_ttl_seconds <= self.worker.execute_timeout_seconds as i64 {
            return Err(EngineError::Configuration(
                "worker.lease_ttl_seconds 必须大于执行超时，否则租约可能在动作完成前被回收"
                    .to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(EngineError::Configuration(
                "retry.backoff_multiplier 不能小于1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(EngineError::Configuration(
                "retry.jitter_factor 必须在 0.0-1.0 之间".to_string(),
            ));
        }
        if self.rate_limit.actions_per_minute == 0 {
            return Err(EngineError::Configuration(
                "rate_limit.actions_per_minute 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tick_interval_seconds, 10);
        assert_eq!(config.session.blocked_policy, BlockedPolicy::Manual);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            r#"
[database]
url = "sqlite://engine.db"

[scheduler]
tick_interval_seconds = 5

[rate_limit]
actions_per_minute = 12

[session.blocked_policy]
mode = "cooldown"
cooldown_seconds = 7200
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.database.url, "sqlite://engine.db");
        assert_eq!(config.scheduler.tick_interval_seconds, 5);
        assert_eq!(config.rate_limit.actions_per_minute, 12);
        assert_eq!(
            config.session.blocked_policy,
            BlockedPolicy::Cooldown {
                cooldown_seconds: 7200
            }
        );
        // 未出现的段使用默认值
        assert_eq!(config.worker.worker_count, 4);
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let result = AppConfig::load(Some("/nonexistent/marketpilot.toml"));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_invalid_lease_ttl_rejected() {
        let mut config = AppConfig::default();
        config.worker.lease_ttl_seconds = 60;
        config.worker.execute_timeout_seconds = 120;
        assert!(config.validate().is_err());
    }
}

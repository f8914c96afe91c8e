use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use marketpilot_core::EngineResult;

use crate::entities::{AccountSession, JobKind};

/// 浏览器动作的分类结果
///
/// 执行器必须把所有失败在此处归类；任务存储永远看不到原始异常。
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// 动作完成，携带市场侧返回的数据
    Success(serde_json::Value),
    /// 网络/超时等瞬时故障，可安全重试
    Transient(String),
    /// 会话过期，需要重新认证后重试
    NeedsReauth,
    /// 风控挑战/封禁信号，账号级熔断
    Blocked(String),
    /// 载荷无效等，重试无意义
    PermanentFailure(String),
}

/// 动作执行器：给定账号会话与抽象动作，通过浏览器自动化完成并返回分类结果
///
/// 市场侧副作用只保证尽力幂等；引擎保证的是任务终态的精确一次记录。
/// 具体市场的DOM脚本是外部适配器，这里只有接口。
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 此执行器负责的任务类型
    fn kind(&self) -> JobKind;

    /// 执行一次动作。调用方负责施加硬超时，超时按 Transient 处理。
    async fn execute(
        &self,
        session: &AccountSession,
        payload: &serde_json::Value,
    ) -> EngineResult<ExecutionOutcome>;
}

/// 执行器注册表：kind -> 执行器，启动时解析一次
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobKind, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn supported_kinds(&self) -> Vec<JobKind> {
        self.executors.keys().copied().collect()
    }
}

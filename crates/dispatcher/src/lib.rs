//! 调度层：tick循环、规则展开、重试决策、账号闸门与崩溃恢复

pub mod cron_utils;
pub mod gate;
pub mod recovery;
pub mod retry;
pub mod scheduler;

pub use cron_utils::RuleSchedule;
pub use gate::{AccountGate, GateDecision, RateLimiter};
pub use recovery::{RecoveryReport, RecoveryService};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::EngineScheduler;

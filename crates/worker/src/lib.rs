//! Worker层：从调度通道消费已认领任务，经账号闸门后执行动作并落终态

pub mod executors;
pub mod pool;

pub use executors::{registry_from_config, BridgeExecutor};
pub use pool::WorkerPool;

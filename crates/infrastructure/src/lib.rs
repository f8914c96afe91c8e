//! 基础设施层：数据库仓储实现与webhook通知投递
//!
//! 仓储接口定义在 `marketpilot-domain`，这里提供 PostgreSQL 与 SQLite
//! 两种后端实现，以及统一的 `DatabaseManager` 入口。

pub mod database;
pub mod webhook;

pub use database::{DatabaseManager, DatabasePool, DatabaseType};
pub use webhook::{WebhookNotifier, WebhookStats};

//! HTTP API层：任务提交/取消/查询与账号会话管理

pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use response::{ApiResponse, PaginatedResponse};
pub use routes::{create_routes, AppState};

pub mod manager;
pub mod postgres;
pub mod sqlite;

pub use manager::{DatabaseManager, DatabasePool, DatabaseType};
pub use postgres::{
    PostgresJobRepository, PostgresLeaseRepository, PostgresRuleRepository,
    PostgresSessionRepository,
};
pub use sqlite::{
    SqliteJobRepository, SqliteLeaseRepository, SqliteRuleRepository, SqliteSessionRepository,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态机
///
/// 合法转换：
/// - Pending -> Processing（认领）
/// - Processing -> Pending（租约冲突/限流回退、重试、崩溃恢复，唯一的回退边）
/// - Pending -> Cancelled（取消）
/// - Processing -> Succeeded | Failed | Cancelled（终态，只进不出）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse_str(s: &str) -> Result<Self, String> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 状态机合法边的判定
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Pending)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// 任务类型，决定调用哪个动作执行器以及载荷的形状
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// 发布草稿商品
    #[serde(rename = "PUBLISH")]
    Publish,
    /// 擦亮/顶帖
    #[serde(rename = "BUMP")]
    Bump,
    /// 自动关注
    #[serde(rename = "FOLLOW")]
    Follow,
    /// 自动回复
    #[serde(rename = "REPLY")]
    Reply,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Publish => "PUBLISH",
            JobKind::Bump => "BUMP",
            JobKind::Follow => "FOLLOW",
            JobKind::Reply => "REPLY",
        }
    }

    pub fn parse_str(s: &str) -> Result<Self, String> {
        match s {
            "PUBLISH" => Ok(JobKind::Publish),
            "BUMP" => Ok(JobKind::Bump),
            "FOLLOW" => Ok(JobKind::Follow),
            "REPLY" => Ok(JobKind::Reply),
            _ => Err(format!("Invalid job kind: {s}")),
        }
    }
}

/// 失败分类：决定重试行为
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    /// 网络/超时，可安全重试
    #[serde(rename = "TRANSIENT")]
    Transient,
    /// 会话过期，需要重新认证
    #[serde(rename = "AUTH")]
    Auth,
    /// 风控/封禁信号，账号级熔断
    #[serde(rename = "BLOCKED")]
    Blocked,
    /// 无效载荷等，重试无意义
    #[serde(rename = "PERMANENT")]
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "TRANSIENT",
            FailureKind::Auth => "AUTH",
            FailureKind::Blocked => "BLOCKED",
            FailureKind::Permanent => "PERMANENT",
        }
    }

    pub fn parse_str(s: &str) -> Result<Self, String> {
        match s {
            "TRANSIENT" => Ok(FailureKind::Transient),
            "AUTH" => Ok(FailureKind::Auth),
            "BLOCKED" => Ok(FailureKind::Blocked),
            "PERMANENT" => Ok(FailureKind::Permanent),
            _ => Err(format!("Invalid failure kind: {s}")),
        }
    }
}

/// 最近一次失败的快照，`status ∈ {processing, failed}` 且至少尝试过一次时存在
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastError {
    pub kind: FailureKind,
    pub message: String,
}

impl LastError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// 任务：一次定时发布或一次循环自动化动作，绑定单个账号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub account_id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    /// 重新认证的重试计数，不计入 attempt_count
    pub reauth_count: i32,
    /// 协作式取消标记：处理中的任务在动作返回后检查
    pub cancel_requested: bool,
    pub last_error: Option<LastError>,
    /// 循环规则展开的自然键 (account_id, kind, time_bucket)，库内唯一
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 终态时间，恰好设置一次
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (账号: {}, 类型: {})",
            self.id,
            self.account_id,
            self.kind.as_str()
        )
    }
}

/// 新建任务的输入，id由数据库生成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub account_id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub dedup_key: Option<String>,
}

impl NewJob {
    pub fn new(
        account_id: impl Into<String>,
        kind: JobKind,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            kind,
            payload,
            scheduled_at,
            max_attempts: 3,
            dedup_key: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_dedup_key(mut self, dedup_key: impl Into<String>) -> Self {
        self.dedup_key = Some(dedup_key.into());
        self
    }
}

/// 任务的终态结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(LastError),
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded => JobStatus::Succeeded,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// 账号会话健康状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionHealth {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "NEEDS_REAUTH")]
    NeedsReauth,
    #[serde(rename = "BLOCKED")]
    Blocked,
}

impl SessionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionHealth::Active => "ACTIVE",
            SessionHealth::NeedsReauth => "NEEDS_REAUTH",
            SessionHealth::Blocked => "BLOCKED",
        }
    }

    pub fn parse_str(s: &str) -> Result<Self, String> {
        match s {
            "ACTIVE" => Ok(SessionHealth::Active),
            "NEEDS_REAUTH" => Ok(SessionHealth::NeedsReauth),
            "BLOCKED" => Ok(SessionHealth::Blocked),
            _ => Err(format!("Invalid session health: {s}")),
        }
    }
}

/// 账号会话：每个账号至多一条活动会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSession {
    pub account_id: String,
    pub health: SessionHealth,
    /// 不透明令牌，仅由会话存储持有；API层永不返回
    #[serde(skip_serializing)]
    pub session_token: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AccountSession {
    pub fn new(account_id: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            health: SessionHealth::Active,
            session_token: session_token.into(),
            last_used_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.health == SessionHealth::Blocked
    }
}

/// 账号并发租约：同一账号同一时刻至多一个在途动作
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLease {
    pub account_id: String,
    pub job_id: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConcurrencyLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 循环自动化规则（如"每2小时擦亮一次"），由调度器幂等展开为任务行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: i64,
    pub account_id: String,
    pub kind: JobKind,
    /// CRON表达式，秒级字段在前（cron crate语法）
    pub schedule: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl AutomationRule {
    /// 规则+时间槽的自然键，保证同一槽位只物化一次
    pub fn dedup_key_for(&self, slot: DateTime<Utc>) -> String {
        format!(
            "{}:{}:{}",
            self.account_id,
            self.kind.as_str(),
            slot.timestamp()
        )
    }
}

/// 任务查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub account_id: Option<String>,
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ---- sqlx 映射：状态枚举在 Postgres / SQLite 均按 VARCHAR 存储 ----

macro_rules! impl_text_enum_sqlx {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Self::parse_str(s).map_err(Into::into)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Self::parse_str(s).map_err(Into::into)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }
    };
}

impl_text_enum_sqlx!(JobStatus);
impl_text_enum_sqlx!(JobKind);
impl_text_enum_sqlx!(FailureKind);
impl_text_enum_sqlx!(SessionHealth);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse_str(status.as_str()), Ok(status));
        }
        assert!(JobStatus::parse_str("RUNNING").is_err());
    }

    #[test]
    fn test_valid_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Pending)); // 崩溃恢复/回退
        assert!(Processing.can_transition_to(Succeeded));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
    }

    #[test]
    fn test_no_backward_or_terminal_transitions() {
        use JobStatus::*;
        // 终态不再转出
        for terminal in [Succeeded, Failed, Cancelled] {
            for to in [Pending, Processing, Succeeded, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
        // pending不能直接到终态（除取消外）
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn test_rule_dedup_key_is_deterministic() {
        let rule = AutomationRule {
            id: 1,
            account_id: "acct-1".to_string(),
            kind: JobKind::Bump,
            schedule: "0 0 */2 * * *".to_string(),
            payload: serde_json::json!({}),
            max_attempts: 3,
            enabled: true,
            created_at: Utc::now(),
        };
        let slot = DateTime::parse_from_rfc3339("2026-08-30T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(rule.dedup_key_for(slot), rule.dedup_key_for(slot));
        assert_eq!(rule.dedup_key_for(slot), "acct-1:BUMP:1788084000");
    }

    #[test]
    fn test_session_token_not_serialized() {
        let session = AccountSession::new("acct-1", "secret-token");
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("secret-token"));
    }
}

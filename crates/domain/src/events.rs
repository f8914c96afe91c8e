use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{JobKind, JobStatus};

/// 任务终态事件，投递给webhook订阅方
///
/// 至少一次投递；订阅方需按 (job_id, status) 去重。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFinishedEvent {
    pub job_id: i64,
    pub account_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub completed_at: DateTime<Utc>,
}

impl JobFinishedEvent {
    pub fn from_job(job: &crate::entities::Job) -> Option<Self> {
        let completed_at = job.completed_at?;
        if !job.status.is_terminal() {
            return None;
        }
        Some(Self {
            job_id: job.id,
            account_id: job.account_id.clone(),
            kind: job.kind,
            status: job.status,
            completed_at,
        })
    }
}

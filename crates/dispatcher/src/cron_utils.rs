//! CRON表达式解析与时间槽计算

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use marketpilot_core::{EngineError, EngineResult};

/// 循环规则的调度表达式包装
///
/// 表达式使用cron crate语法，秒级字段在前，
/// 例如 `0 0 */2 * * *` 表示每2小时整点。
#[derive(Debug)]
pub struct RuleSchedule {
    schedule: Schedule,
}

impl RuleSchedule {
    pub fn new(expr: &str) -> EngineResult<Self> {
        let schedule = Schedule::from_str(expr).map_err(|e| EngineError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { schedule })
    }

    /// 校验表达式，不保留解析结果
    pub fn validate(expr: &str) -> EngineResult<()> {
        Self::new(expr).map(|_| ())
    }

    /// `(from, until]` 窗口内的全部执行时间槽，升序
    ///
    /// 规则展开用：每个槽位对应一条以 (账号, 类型, 槽位) 去重的任务。
    pub fn slots_within(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from)
            .take_while(|t| *t <= until)
            .collect()
    }

    /// 下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_invalid_expression_is_rejected() {
        let err = RuleSchedule::new("not a cron").unwrap_err();
        assert!(matches!(err, EngineError::InvalidCron { .. }));
        assert!(RuleSchedule::validate("0 0 */2 * * *").is_ok());
    }

    #[test]
    fn test_slots_within_window() {
        // 每小时整点
        let schedule = RuleSchedule::new("0 0 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 8, 30, 10, 30, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 8, 30, 13, 0, 0).unwrap();

        let slots = schedule.slots_within(from, until);
        assert_eq!(
            slots,
            vec![
                Utc.with_ymd_and_hms(2026, 8, 30, 11, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 8, 30, 13, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_empty_window_has_no_slots() {
        let schedule = RuleSchedule::new("0 0 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 8, 30, 10, 5, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 8, 30, 10, 10, 0).unwrap();
        assert!(schedule.slots_within(from, until).is_empty());
    }

    #[test]
    fn test_next_execution_time() {
        let schedule = RuleSchedule::new("0 0 */2 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 8, 30, 9, 0, 0).unwrap();
        assert_eq!(
            schedule.next_execution_time(from),
            Some(Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap())
        );
    }
}

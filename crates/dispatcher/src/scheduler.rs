//! 调度循环：规则展开 + 到期任务认领分发

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use marketpilot_core::config::SchedulerConfig;
use marketpilot_core::EngineResult;
use marketpilot_domain::entities::{AutomationRule, Job, NewJob};
use marketpilot_domain::repositories::{JobRepository, RuleRepository};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::cron_utils::RuleSchedule;

/// 引擎调度器
///
/// 每个tick做两件事：把循环规则幂等展开为任务行，
/// 再原子认领到期任务推入Worker通道。通道有界，满时产生背压。
pub struct EngineScheduler {
    jobs: Arc<dyn JobRepository>,
    rules: Arc<dyn RuleRepository>,
    config: SchedulerConfig,
    job_tx: mpsc::Sender<Job>,
}

impl EngineScheduler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        rules: Arc<dyn RuleRepository>,
        config: SchedulerConfig,
        job_tx: mpsc::Sender<Job>,
    ) -> Self {
        Self {
            jobs,
            rules,
            config,
            job_tx,
        }
    }

    /// 把启用的循环规则展开为lookahead窗口内的任务行
    ///
    /// 以 (账号, 类型, 时间槽) 去重，重复tick不会产生重复任务。
    pub async fn expand_rules(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let rules = self.rules.list_enabled().await?;
        let until = now + Duration::seconds(self.config.rule_lookahead_seconds as i64);
        let mut materialized = 0;

        for rule in &rules {
            match self.expand_rule(rule, now, until).await {
                Ok(count) => materialized += count,
                Err(e) => {
                    // 单条规则失败不拖垮整个tick
                    error!(rule_id = rule.id, error = %e, "规则展开失败");
                }
            }
        }

        if materialized > 0 {
            debug!(count = materialized, "循环规则已展开为任务");
        }
        Ok(materialized)
    }

    async fn expand_rule(
        &self,
        rule: &AutomationRule,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let schedule = match RuleSchedule::new(&rule.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(rule_id = rule.id, schedule = %rule.schedule, error = %e, "CRON表达式无效，跳过规则");
                return Ok(0);
            }
        };

        let mut materialized = 0;
        for slot in schedule.slots_within(now, until) {
            let new_job = NewJob::new(
                rule.account_id.clone(),
                rule.kind,
                rule.payload.clone(),
                slot,
            )
            .with_max_attempts(rule.max_attempts)
            .with_dedup_key(rule.dedup_key_for(slot));

            if self.jobs.enqueue_if_absent(&new_job).await?.is_some() {
                materialized += 1;
            }
        }
        Ok(materialized)
    }

    /// 认领到期任务并推入Worker通道
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let claimed = self
            .jobs
            .claim_due(self.config.claim_batch_limit, now)
            .await?;

        let mut dispatched = 0;
        let mut pending = claimed.into_iter();
        while let Some(job) = pending.next() {
            if let Err(send_err) = self.job_tx.send(job).await {
                // 通道已关闭（停机中），整批剩余认领一并还回去，不能滞留processing
                warn!("Worker通道已关闭，本批认领回退pending");
                for stranded in std::iter::once(send_err.0).chain(pending) {
                    if let Err(e) = self.jobs.release(stranded.id, Duration::zero()).await {
                        error!(job_id = stranded.id, error = %e, "任务回退失败");
                    }
                }
                return Ok(dispatched);
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// 单次tick：先展开规则，再分发到期任务
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<()> {
        self.expand_rules(now).await?;
        self.dispatch_due(now).await?;
        Ok(())
    }

    /// 调度主循环，收到停机信号后退出
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(
            self.config.tick_interval_seconds,
        ));
        info!(
            tick_interval = self.config.tick_interval_seconds,
            "调度循环已启动"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "调度tick失败");
                    }
                }
                _ = shutdown.recv() => {
                    info!("调度循环收到停机信号");
                    break;
                }
            }
        }
    }
}

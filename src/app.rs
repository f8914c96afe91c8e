use std::sync::Arc;

use anyhow::{Context, Result};
use marketpilot_api::{create_routes, AppState};
use marketpilot_core::AppConfig;
use marketpilot_dispatcher::{AccountGate, EngineScheduler, RecoveryService, RetryPolicy};
use marketpilot_infrastructure::{DatabaseManager, WebhookNotifier};
use marketpilot_worker::{registry_from_config, WorkerPool};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy)]
pub enum AppMode {
    /// 仅运行调度/执行引擎
    Engine,
    /// 仅运行API服务器
    Api,
    /// 单进程运行全部组件
    All,
}

/// 主应用：建库、恢复、装配各组件
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    db: Arc<DatabaseManager>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!(?mode, "初始化应用");

        let db = DatabaseManager::new(&config.database)
            .await
            .context("建立数据库连接失败")?;
        db.migrate().await.context("数据库迁移失败")?;

        Ok(Self {
            config,
            mode,
            db: Arc::new(db),
        })
    }

    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        match self.mode {
            AppMode::Engine => self.run_engine(shutdown).await,
            AppMode::Api => self.run_api(shutdown).await,
            AppMode::All => self.run_all(shutdown).await,
        }
    }

    /// 引擎模式：启动恢复 + 调度循环 + 恢复循环 + Worker池
    async fn run_engine(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let jobs = self.db.job_repository();
        let sessions = self.db.session_repository();
        let leases = self.db.lease_repository();
        let rules = self.db.rule_repository();

        // 上个进程遗留的processing任务与孤儿租约先回收
        let recovery = RecoveryService::new(
            jobs.clone(),
            leases.clone(),
            sessions.clone(),
            self.config.session.clone(),
            &self.config.scheduler,
        );
        let report = recovery
            .recover_on_startup()
            .await
            .context("启动恢复失败")?;
        if !report.is_noop() {
            info!(
                released_jobs = report.released_jobs,
                reclaimed_leases = report.reclaimed_leases,
                "启动恢复完成"
            );
        }

        let registry = Arc::new(registry_from_config(&self.config.executor));
        if registry.supported_kinds().is_empty() {
            warn!("执行器注册表为空，认领的任务将以不支持的类型落败");
        }

        let gate = Arc::new(AccountGate::new(
            sessions.clone(),
            leases.clone(),
            &self.config.rate_limit,
            &self.config.worker,
        ));
        let notifier = if self.config.webhook.subscribers.is_empty() {
            None
        } else {
            Some(Arc::new(WebhookNotifier::new(&self.config.webhook)))
        };

        let (job_tx, job_rx) = mpsc::channel(self.config.worker.queue_capacity);
        let scheduler = EngineScheduler::new(
            jobs.clone(),
            rules,
            self.config.scheduler.clone(),
            job_tx,
        );
        let pool = Arc::new(WorkerPool::new(
            jobs,
            sessions,
            gate,
            registry,
            RetryPolicy::new(self.config.retry.clone()),
            notifier,
            self.config.worker.clone(),
        ));

        let worker_handles = pool.spawn(job_rx, shutdown.clone());
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown.subscribe()));
        let recovery_handle = tokio::spawn(recovery.run(shutdown.subscribe()));

        info!(
            worker_count = self.config.worker.worker_count,
            "引擎已启动"
        );

        let mut shutdown_rx = shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("引擎收到关闭信号");

        let _ = scheduler_handle.await;
        let _ = recovery_handle.await;
        for handle in worker_handles {
            let _ = handle.await;
        }

        info!("引擎已停止");
        Ok(())
    }

    /// API模式：axum服务器
    async fn run_api(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let state = AppState {
            job_repo: self.db.job_repository(),
            session_repo: self.db.session_repository(),
            rule_repo: self.db.rule_repository(),
            default_max_attempts: self.config.retry.default_max_attempts,
        };

        let mut app = create_routes(state);
        if self.config.api.cors_enabled {
            app = app.layer(CorsLayer::permissive());
        }

        let bind_address = &self.config.api.bind_address;
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("API服务器启动在 http://{bind_address}");

        let mut shutdown_rx = shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            })
            .await
            .context("API服务器运行失败")?;

        info!("API服务器已停止");
        Ok(())
    }

    /// 单进程模式：引擎与API共享同一个数据库连接池
    async fn run_all(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let mut handles = Vec::new();

        {
            let app = self.clone_for_mode(AppMode::Engine);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = app.run_engine(shutdown).await {
                    error!(error = %e, "引擎运行失败");
                }
            }));
        }

        if self.config.api.enabled {
            let app = self.clone_for_mode(AppMode::Api);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = app.run_api(shutdown).await {
                    error!(error = %e, "API服务器运行失败");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!("所有组件已停止");
        Ok(())
    }

    fn clone_for_mode(&self, mode: AppMode) -> Self {
        Self {
            config: self.config.clone(),
            mode,
            db: Arc::clone(&self.db),
        }
    }
}

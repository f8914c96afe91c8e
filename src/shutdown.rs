use tokio::sync::broadcast;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 所有长驻组件订阅同一个广播通道；触发一次后重复调用是no-op。
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self { shutdown_tx }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// 组件内部继续分发信号用的发送端
    pub fn sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// 触发关闭
    pub fn shutdown(&self) {
        let subscriber_count = self.shutdown_tx.receiver_count();
        debug!("发送关闭信号给 {subscriber_count} 个订阅者");
        // 没有接收者时发送失败，不是错误
        let _ = self.shutdown_tx.send(());
        info!("关闭信号已发送");
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

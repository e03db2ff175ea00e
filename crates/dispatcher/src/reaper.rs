use std::sync::Arc;

use chrono::Utc;
use orchestrator_core::{ConfigHandle, EventStore, OrchestratorError, OrchestratorResult};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::registry::WorkerRegistry;

/// 周期性回收心跳超时的Worker，顺带清理过期的持久化事件
pub struct Reaper {
    registry: Arc<WorkerRegistry>,
    config: ConfigHandle,
    events: Option<Arc<dyn EventStore>>,
}

impl Reaper {
    pub fn new(registry: Arc<WorkerRegistry>, config: ConfigHandle) -> Self {
        Self {
            registry,
            config,
            events: None,
        }
    }

    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.events = Some(store);
        self
    }

    /// 执行回收循环直到收到关闭信号，间隔每轮从配置重新读取
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("启动Worker失效检测循环");
        loop {
            let interval = self.config.current().registry.reap_interval();
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出Worker失效检测循环");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.registry.reap_stale().await {
                error!("Worker失效检测时出错: {}", e);
            }
            if let Err(e) = self.prune_events().await {
                error!("清理过期事件时出错: {}", e);
            }
        }
    }

    /// 删除超过保留时长的事件，未启用持久化或保留时长为0时不做任何事
    pub async fn prune_events(&self) -> OrchestratorResult<u64> {
        let Some(store) = &self.events else {
            return Ok(0);
        };
        let Some(retention) = self.config.current().event_bus.retention() else {
            return Ok(0);
        };
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| OrchestratorError::Configuration(format!("事件保留时长无效: {e}")))?;
        let removed = store.prune_before(Utc::now() - retention).await?;
        if removed > 0 {
            info!("已清理 {} 条过期事件", removed);
            metrics::counter!("orchestrator_events_pruned_total").increment(removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixture_with;
    use orchestrator_core::{AppConfig, EventDraft, TopicPattern};
    use orchestrator_infrastructure::SqliteEventStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_prune_follows_retention_setting() {
        let mut config = AppConfig::default();
        config.event_bus.retention_seconds = 3600;
        let f = fixture_with(config).await;
        let store = Arc::new(SqliteEventStore::new(f.db.clone()));

        let mut stale = EventDraft::new("task.created", json!({})).into_event();
        stale.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.append(&stale).await.unwrap();
        let fresh = EventDraft::new("task.created", json!({})).into_event();
        store.append(&fresh).await.unwrap();

        let reaper = Reaper::new(f.registry.clone(), f.config.clone());
        assert_eq!(reaper.prune_events().await.unwrap(), 0);

        let reaper = reaper.with_event_store(store.clone());
        assert_eq!(reaper.prune_events().await.unwrap(), 1);
        let left = store
            .since(&TopicPattern::All, Utc::now() - chrono::Duration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_everything() {
        let mut config = AppConfig::default();
        config.event_bus.retention_seconds = 0;
        let f = fixture_with(config).await;
        let store = Arc::new(SqliteEventStore::new(f.db.clone()));
        let mut ancient = EventDraft::new("task.created", json!({})).into_event();
        ancient.timestamp = Utc::now() - chrono::Duration::days(365);
        store.append(&ancient).await.unwrap();

        let reaper = Reaper::new(f.registry.clone(), f.config.clone()).with_event_store(store);
        assert_eq!(reaper.prune_events().await.unwrap(), 0);
    }
}

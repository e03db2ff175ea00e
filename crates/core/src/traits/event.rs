use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Event, EventDraft, TopicPattern};
use crate::OrchestratorResult;

/// 事件发布接口，任务引擎与注册中心只依赖它而不依赖具体总线
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 返回事件ID
    async fn publish(&self, draft: EventDraft) -> OrchestratorResult<String>;
}

/// 事件的持久化镜像，用于超出内存回放窗口的恢复
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &Event) -> OrchestratorResult<()>;

    /// 按时间顺序返回 `since` 之后（含）匹配的事件
    async fn since(
        &self,
        pattern: &TopicPattern,
        since: DateTime<Utc>,
        limit: u32,
    ) -> OrchestratorResult<Vec<Event>>;

    /// 删除 `cutoff` 之前的事件，返回删除条数
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<u64>;
}

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_core::Event;

/// 事件处理器
///
/// 返回错误时由总线按重试策略重新投递，重试耗尽后进入死信集合。
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 出现在日志与死信记录中的名称
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// 用闭包构造处理器
pub fn handler_fn<S, F, Fut>(name: S, f: F) -> Arc<dyn EventHandler>
where
    S: Into<String>,
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

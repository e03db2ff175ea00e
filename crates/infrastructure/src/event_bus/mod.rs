//! 进程内优先级事件总线
//!
//! - 五条严格优先级通道，每个主题一个有界队列，满时阻塞或拒绝由调用方选择
//! - 同一主题同一优先级按发布顺序投递
//! - 处理器失败按指数退避重试，耗尽后进入死信集合并发布 `bus.dead_letter`
//! - 每主题的回放环形缓冲，超出范围时回退到持久化的 events 表

mod dead_letter;
mod dispatch_queue;
mod handler;
mod replay;
mod retry;

pub use dead_letter::{DeadLetter, DeadLetterSet};
pub use dispatch_queue::{Backpressure, DispatchQueue};
pub use handler::{handler_fn, EventHandler};
pub use replay::{ReplayBuffer, ReplayWindow};
pub use retry::RetryPolicy;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, Stream};
use orchestrator_core::config::models::EventBusConfig;
use orchestrator_core::{
    topics, Event, EventDraft, EventPriority, EventPublisher, EventStore, OrchestratorError,
    OrchestratorResult, TopicPattern,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 回放时单次返回的默认条数上限
pub const DEFAULT_REPLAY_LIMIT: u32 = 1_000;

const TAP_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    priority: EventPriority,
    handler: Arc<dyn EventHandler>,
}

/// 总线运行统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// 各优先级通道排队中的事件数
    pub pending: BTreeMap<String, usize>,
    pub subscriptions: usize,
    pub replay_topics: usize,
    pub replay_events: usize,
    pub dead_letters: usize,
    pub published_total: u64,
    pub delivered_total: u64,
    pub handler_failures_total: u64,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

struct BusInner {
    queue: DispatchQueue,
    replay: ReplayBuffer,
    dead_letters: DeadLetterSet,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    retry_policy: RwLock<RetryPolicy>,
    publish_timeout: RwLock<Duration>,
    store: Option<Arc<dyn EventStore>>,
    tap: broadcast::Sender<Event>,
    next_subscription: AtomicU64,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: BusCounters,
}

/// 事件总线句柄，克隆后共享同一个总线
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// 创建总线并启动投递协程，`store` 为持久化镜像
    pub fn start(config: &EventBusConfig, store: Option<Arc<dyn EventStore>>) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        let inner = Arc::new(BusInner {
            queue: DispatchQueue::new(config.queue_capacity),
            replay: ReplayBuffer::new(config.replay_capacity),
            dead_letters: DeadLetterSet::new(config.dead_letter_capacity),
            subscriptions: RwLock::new(Vec::new()),
            retry_policy: RwLock::new(RetryPolicy::from_config(config)),
            publish_timeout: RwLock::new(config.publish_timeout()),
            store,
            tap,
            next_subscription: AtomicU64::new(1),
            workers: tokio::sync::Mutex::new(Vec::new()),
            counters: BusCounters::default(),
        });

        let handles: Vec<JoinHandle<()>> = (0..config.dispatch_workers.max(1))
            .map(|worker| tokio::spawn(dispatch_loop(inner.clone(), worker)))
            .collect();
        if let Ok(mut workers) = inner.workers.try_lock() {
            workers.extend(handles);
        }

        info!(
            "事件总线已启动: dispatch_workers={}, queue_capacity={}, replay_capacity={}, durable={}",
            config.dispatch_workers,
            config.queue_capacity,
            config.replay_capacity,
            inner.store.is_some()
        );
        Self { inner }
    }

    /// 热更新重试策略、发布超时与死信容量
    pub fn apply_config(&self, config: &EventBusConfig) {
        let policy = RetryPolicy::from_config(config);
        {
            let mut current = self
                .inner
                .retry_policy
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *current != policy {
                debug!("事件总线重试策略已更新: {:?}", policy);
                *current = policy;
            }
        }
        *self
            .inner
            .publish_timeout
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config.publish_timeout();
        self.inner
            .dead_letters
            .set_capacity(config.dead_letter_capacity);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }

    /// 订阅匹配 `pattern` 的事件；同一事件按订阅优先级从高到低依次交给处理器
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        priority: EventPriority,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            pattern: TopicPattern::parse(pattern),
            priority,
            handler,
        });
        let mut subs = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(
            "新增订阅: id={}, pattern={}, handler={}",
            id.0,
            subscription.pattern,
            subscription.handler.name()
        );
        subs.push(subscription);
        subs.sort_by_key(|s| (s.priority.lane(), s.id.0));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub async fn publish_with(
        &self,
        draft: EventDraft,
        backpressure: Backpressure,
    ) -> OrchestratorResult<String> {
        self.inner.publish(draft, backpressure).await
    }

    /// 依次发布，遇到第一个错误即停止
    pub async fn publish_batch(
        &self,
        drafts: Vec<EventDraft>,
        backpressure: Backpressure,
    ) -> OrchestratorResult<Vec<String>> {
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            ids.push(self.inner.publish(draft, backpressure).await?);
        }
        Ok(ids)
    }

    pub async fn replay(
        &self,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<Event>> {
        self.replay_limited(pattern, since, DEFAULT_REPLAY_LIMIT).await
    }

    /// 先查内存环形缓冲；缓冲未完整覆盖 `since` 且挂载了持久化镜像时改查 events 表
    pub async fn replay_limited(
        &self,
        pattern: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> OrchestratorResult<Vec<Event>> {
        let pattern = TopicPattern::parse(pattern);
        let window = self.inner.replay.since(&pattern, since);
        if !window.complete {
            if let Some(store) = &self.inner.store {
                debug!("回放范围超出内存缓冲，改用持久化事件: pattern={}", pattern);
                return store.since(&pattern, since, limit).await;
            }
        }
        let mut events = window.events;
        events.truncate(limit as usize);
        Ok(events)
    }

    /// 在触发动作之前创建等待器，避免错过事件
    pub fn waiter(&self, pattern: &str) -> EventWaiter {
        EventWaiter {
            pattern: TopicPattern::parse(pattern),
            rx: self.inner.tap.subscribe(),
        }
    }

    /// 等待下一个匹配的事件，超时返回 `Timeout`
    pub async fn wait_for<P>(
        &self,
        pattern: &str,
        predicate: P,
        timeout: Duration,
    ) -> OrchestratorResult<Event>
    where
        P: Fn(&Event) -> bool,
    {
        self.waiter(pattern).wait(predicate, timeout).await
    }

    /// 只读的事件流，不参与重试与死信
    pub fn stream(&self, pattern: &str) -> impl Stream<Item = Event> + Send + 'static {
        let pattern = TopicPattern::parse(pattern);
        let rx = self.inner.tap.subscribe();
        futures::stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if pattern.matches(&event.topic) => {
                        return Some((event, (rx, pattern)))
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("事件流消费过慢，跳过 {} 个事件", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.list()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.inner.dead_letters.len()
    }

    /// 把死信事件重新放回投递队列，不存在时返回 false
    pub async fn redeliver_dead_letter(&self, event_id: &str) -> OrchestratorResult<bool> {
        let letters = self.inner.dead_letters.take(event_id);
        let Some(letter) = letters.into_iter().next() else {
            return Ok(false);
        };
        let mut event = letter.event;
        event.retry_count = 0;
        let timeout = self.inner.publish_timeout();
        self.inner
            .queue
            .push(event, Backpressure::Block(timeout))
            .await?;
        info!("死信事件已重新投递: {}", event_id);
        Ok(true)
    }

    pub fn stats(&self) -> EventBusStats {
        let pending = self.inner.queue.pending_by_lane();
        let (replay_topics, replay_events) = self.inner.replay.sizes();
        EventBusStats {
            pending: EventPriority::ALL
                .iter()
                .map(|p| (p.as_str().to_string(), pending[p.lane()]))
                .collect(),
            subscriptions: self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            replay_topics,
            replay_events,
            dead_letters: self.inner.dead_letters.len(),
            published_total: self.inner.counters.published.load(Ordering::Relaxed),
            delivered_total: self.inner.counters.delivered.load(Ordering::Relaxed),
            handler_failures_total: self.inner.counters.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// 停止接收新事件，等待已排队的事件投递完毕
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        let handles: Vec<JoinHandle<()>> = self.inner.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("事件投递协程异常退出: {}", e);
            }
        }
        info!("事件总线已停止");
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, draft: EventDraft) -> OrchestratorResult<String> {
        let timeout = self.inner.publish_timeout();
        self.inner.publish(draft, Backpressure::Block(timeout)).await
    }
}

/// 事件等待器
pub struct EventWaiter {
    pattern: TopicPattern,
    rx: broadcast::Receiver<Event>,
}

impl EventWaiter {
    pub async fn wait<P>(mut self, predicate: P, timeout: Duration) -> OrchestratorResult<Event>
    where
        P: Fn(&Event) -> bool,
    {
        let pattern = self.pattern.clone();
        let rx = &mut self.rx;
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if pattern.matches(&event.topic) && predicate(&event) => {
                        return Ok(event)
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("等待事件时跳过 {} 个事件", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(OrchestratorError::internal("事件总线已关闭"))
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestratorError::Timeout(format!("等待事件 {pattern} 超时")))?
    }
}

impl BusInner {
    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_timeout(&self) -> Duration {
        *self
            .publish_timeout
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn publish(
        &self,
        draft: EventDraft,
        backpressure: Backpressure,
    ) -> OrchestratorResult<String> {
        if draft.topic.trim().is_empty() || draft.topic.contains('*') {
            return Err(OrchestratorError::validation(format!(
                "无效的事件主题: '{}'",
                draft.topic
            )));
        }

        let event = draft.into_event();
        self.queue.push(event.clone(), backpressure).await?;
        self.replay.record(&event);
        // 没有流订阅者时发送失败是正常的
        let _ = self.tap.send(event.clone());

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "orchestrator_events_published_total",
            "priority" => event.priority.as_str()
        )
        .increment(1);

        if let Some(store) = &self.store {
            store.append(&event).await?;
        }
        debug!("事件已发布: id={}, topic={}", event.id, event.topic);
        Ok(event.id)
    }

    fn matching(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .cloned()
            .collect()
    }

    async fn deliver(&self, event: &Event) {
        for subscription in self.matching(&event.topic) {
            self.invoke(&subscription, event).await;
        }
    }

    async fn invoke(&self, subscription: &Subscription, event: &Event) {
        let policy = self.retry_policy();
        let mut attempt: u32 = 0;
        loop {
            let outcome = AssertUnwindSafe(subscription.handler.handle(event))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => "处理器发生panic".to_string(),
            };
            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);

            if attempt >= policy.max_retries {
                self.dead_letter(subscription, event, attempt, error).await;
                return;
            }
            let delay = policy.delay(attempt);
            warn!(
                "事件处理失败，{:?} 后重试: event_id={}, topic={}, handler={}, attempt={}, error={}",
                delay,
                event.id,
                event.topic,
                subscription.handler.name(),
                attempt + 1,
                error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn dead_letter(
        &self,
        subscription: &Subscription,
        event: &Event,
        retries: u32,
        error: String,
    ) {
        let mut failed = event.clone();
        failed.retry_count = retries;
        let handler = subscription.handler.name().to_string();
        error!(
            "事件处理重试耗尽，进入死信: event_id={}, topic={}, handler={}, error={}",
            event.id, event.topic, handler, error
        );
        metrics::counter!("orchestrator_events_dead_lettered_total").increment(1);

        self.dead_letters.push(DeadLetter {
            event: failed,
            handler: handler.clone(),
            error: error.clone(),
            failed_at: Utc::now(),
        });

        // 死信通知本身失败时不再继续通知
        if event.topic == topics::BUS_DEAD_LETTER {
            return;
        }
        let notice = EventDraft::new(
            topics::BUS_DEAD_LETTER,
            json!({
                "event_id": event.id,
                "topic": event.topic,
                "handler": handler,
                "error": error,
                "retry_count": retries,
            }),
        )
        .with_priority(EventPriority::High)
        .with_correlation_id(event.correlation_id.clone());

        if let Err(e) = self
            .publish(notice, Backpressure::Block(self.publish_timeout()))
            .await
        {
            error!("发布死信通知失败: event_id={}, error={}", event.id, e);
        }
    }
}

async fn dispatch_loop(inner: Arc<BusInner>, worker: usize) {
    debug!("事件投递协程 {} 启动", worker);
    while let Some(event) = inner.queue.pop().await {
        inner.deliver(&event).await;
        inner.queue.complete(&event.topic);
    }
    debug!("事件投递协程 {} 退出", worker);
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use orchestrator_core::{Event, EventPriority, OrchestratorError, OrchestratorResult};
use tokio::sync::Notify;
use tokio::time::Instant;

/// 队列满时 `publish` 的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// 最多阻塞给定时长，超时返回 `Timeout`
    Block(Duration),
    /// 立即返回 `QueueFull`
    Reject,
}

#[derive(Default)]
struct QueueState {
    lanes: [VecDeque<Event>; EventPriority::LANES],
    /// 各主题排队中的事件数
    depth: HashMap<String, usize>,
    /// 正在投递的主题，同一主题同时只投递一个事件
    busy: HashSet<String>,
    closed: bool,
}

impl QueueState {
    fn next_dispatchable(&mut self) -> Option<Event> {
        for lane in self.lanes.iter_mut() {
            let position = lane.iter().position(|e| !self.busy.contains(&e.topic));
            if let Some(event) = position.and_then(|idx| lane.remove(idx)) {
                if let Some(depth) = self.depth.get_mut(&event.topic) {
                    *depth = depth.saturating_sub(1);
                    if *depth == 0 {
                        self.depth.remove(&event.topic);
                    }
                }
                self.busy.insert(event.topic.clone());
                return Some(event);
            }
        }
        None
    }

    fn is_drained(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}

/// 五条严格优先级通道 + 每主题有界队列
///
/// 出队时从最高优先级通道开始，跳过正在投递的主题，因此同一主题同一优先级的事件按入队顺序投递。
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    item_ready: Notify,
    space_freed: Notify,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            item_ready: Notify::new(),
            space_freed: Notify::new(),
        }
    }

    pub async fn push(&self, event: Event, backpressure: Backpressure) -> OrchestratorResult<()> {
        let deadline = match backpressure {
            Backpressure::Block(timeout) => Some(Instant::now() + timeout),
            Backpressure::Reject => None,
        };
        let mut event = Some(event);

        loop {
            let notified = self.space_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return Err(OrchestratorError::internal("事件总线已关闭"));
                }
                let Some(pending) = event.take() else {
                    return Err(OrchestratorError::internal("事件入队状态异常"));
                };
                let depth = state.depth.get(&pending.topic).copied().unwrap_or(0);
                if depth < self.capacity {
                    *state.depth.entry(pending.topic.clone()).or_insert(0) += 1;
                    let lane = pending.priority.lane();
                    state.lanes[lane].push_back(pending);
                    drop(state);
                    self.item_ready.notify_waiters();
                    return Ok(());
                }
                match deadline {
                    None => {
                        return Err(OrchestratorError::QueueFull {
                            topic: pending.topic,
                        })
                    }
                    Some(deadline) if Instant::now() >= deadline => {
                        return Err(OrchestratorError::Timeout(format!(
                            "等待主题 {} 的队列空间超时",
                            pending.topic
                        )))
                    }
                    Some(_) => event = Some(pending),
                }
            }

            if let Some(deadline) = deadline {
                // 超时后回到循环顶部再检查一次
                let _ = tokio::time::timeout_at(deadline, notified).await;
            }
        }
    }

    /// 取出下一个可投递的事件；队列关闭且已排空时返回 `None`
    pub async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(event) = state.next_dispatchable() {
                    drop(state);
                    self.space_freed.notify_waiters();
                    return Some(event);
                }
                if state.closed && state.is_drained() {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// 主题的当前事件投递完毕
    pub fn complete(&self, topic: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.busy.remove(topic);
        drop(state);
        self.item_ready.notify_waiters();
    }

    /// 拒绝新的事件，已排队的事件仍会被投递
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        drop(state);
        self.item_ready.notify_waiters();
        self.space_freed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// 各通道排队中的事件数，按优先级从高到低
    pub fn pending_by_lane(&self) -> [usize; EventPriority::LANES] {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pending = [0; EventPriority::LANES];
        for (idx, lane) in state.lanes.iter().enumerate() {
            pending[idx] = lane.len();
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::EventDraft;
    use serde_json::json;

    fn event(topic: &str, priority: EventPriority) -> Event {
        EventDraft::new(topic, json!({}))
            .with_priority(priority)
            .into_event()
    }

    #[tokio::test]
    async fn test_strict_priority_order() {
        let queue = DispatchQueue::new(10);
        queue
            .push(event("a", EventPriority::Deferred), Backpressure::Reject)
            .await
            .unwrap();
        queue
            .push(event("b", EventPriority::Low), Backpressure::Reject)
            .await
            .unwrap();
        queue
            .push(event("c", EventPriority::Critical), Backpressure::Reject)
            .await
            .unwrap();

        let order: Vec<String> = [
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.topic)
        .collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_busy_topic_is_skipped_until_completed() {
        let queue = DispatchQueue::new(10);
        let first = event("t", EventPriority::Default);
        let second = event("t", EventPriority::Default);
        let other = event("u", EventPriority::Default);
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        for e in [first, second, other] {
            queue.push(e, Backpressure::Reject).await.unwrap();
        }

        assert_eq!(queue.pop().await.unwrap().id, first_id);
        // t 正在投递，下一个是 u
        assert_eq!(queue.pop().await.unwrap().topic, "u");
        queue.complete("t");
        assert_eq!(queue.pop().await.unwrap().id, second_id);
    }

    #[tokio::test]
    async fn test_full_topic_rejects_or_times_out() {
        let queue = DispatchQueue::new(1);
        queue
            .push(event("t", EventPriority::Default), Backpressure::Reject)
            .await
            .unwrap();

        let rejected = queue
            .push(event("t", EventPriority::Default), Backpressure::Reject)
            .await;
        assert!(matches!(rejected, Err(OrchestratorError::QueueFull { .. })));

        let blocked = queue
            .push(
                event("t", EventPriority::Default),
                Backpressure::Block(Duration::from_millis(20)),
            )
            .await;
        assert!(matches!(blocked, Err(OrchestratorError::Timeout(_))));

        // 其他主题不受影响
        queue
            .push(event("u", EventPriority::Default), Backpressure::Reject)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocked_publisher_resumes_when_space_frees() {
        let queue = std::sync::Arc::new(DispatchQueue::new(1));
        queue
            .push(event("t", EventPriority::Default), Backpressure::Reject)
            .await
            .unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .push(
                        event("t", EventPriority::Default),
                        Backpressure::Block(Duration::from_secs(2)),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.pop().await.unwrap();
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pending_by_lane()[EventPriority::Default.lane()], 1);
    }

    #[tokio::test]
    async fn test_close_drains_before_returning_none() {
        let queue = DispatchQueue::new(10);
        queue
            .push(event("t", EventPriority::Default), Backpressure::Reject)
            .await
            .unwrap();
        queue.close();

        assert!(queue
            .push(event("t", EventPriority::Default), Backpressure::Reject)
            .await
            .is_err());
        assert!(queue.pop().await.is_some());
        queue.complete("t");
        assert!(queue.pop().await.is_none());
    }
}

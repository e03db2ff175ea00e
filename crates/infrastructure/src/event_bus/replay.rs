use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use orchestrator_core::{Event, TopicPattern};

struct TopicRing {
    events: VecDeque<(u64, Event)>,
    /// 被挤出环形缓冲的最新事件时间
    evicted_until: Option<DateTime<Utc>>,
}

/// 每个主题一个定长环形缓冲，记录最近发布的事件，与投递结果无关
pub struct ReplayBuffer {
    rings: Mutex<HashMap<String, TopicRing>>,
    capacity: usize,
    started_at: DateTime<Utc>,
    seq: std::sync::atomic::AtomicU64,
}

/// 一次内存回放的结果
pub struct ReplayWindow {
    pub events: Vec<Event>,
    /// 内存中的事件是否完整覆盖了请求的时间范围
    pub complete: bool,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            started_at: Utc::now(),
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: &Event) {
        let seq = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = rings.entry(event.topic.clone()).or_insert_with(|| TopicRing {
            events: VecDeque::with_capacity(self.capacity),
            evicted_until: None,
        });
        if ring.events.len() >= self.capacity {
            if let Some((_, evicted)) = ring.events.pop_front() {
                ring.evicted_until = Some(
                    ring.evicted_until
                        .map_or(evicted.timestamp, |ts| ts.max(evicted.timestamp)),
                );
            }
        }
        ring.events.push_back((seq, event.clone()));
    }

    /// 匹配 `pattern` 且时间不早于 `since` 的事件，按发布顺序
    pub fn since(&self, pattern: &TopicPattern, since: DateTime<Utc>) -> ReplayWindow {
        let rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        let mut complete = since >= self.started_at;
        let mut matched: Vec<(u64, Event)> = Vec::new();

        for (topic, ring) in rings.iter() {
            if !pattern.matches(topic) {
                continue;
            }
            if ring.evicted_until.is_some_and(|ts| ts >= since) {
                complete = false;
            }
            matched.extend(
                ring.events
                    .iter()
                    .filter(|(_, e)| e.timestamp >= since)
                    .cloned(),
            );
        }
        matched.sort_by_key(|(seq, _)| *seq);

        ReplayWindow {
            events: matched.into_iter().map(|(_, e)| e).collect(),
            complete,
        }
    }

    /// (主题数, 事件总数)
    pub fn sizes(&self) -> (usize, usize) {
        let rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        (rings.len(), rings.values().map(|r| r.events.len()).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::EventDraft;
    use serde_json::json;

    fn event(topic: &str, n: i64) -> Event {
        EventDraft::new(topic, json!({ "n": n })).into_event()
    }

    #[test]
    fn test_ring_keeps_latest_events_per_topic() {
        let buffer = ReplayBuffer::new(3);
        let start = Utc::now();
        for n in 0..5 {
            buffer.record(&event("task.created", n));
        }
        buffer.record(&event("agent.started", 99));

        let window = buffer.since(&TopicPattern::parse("task.created"), start);
        let ns: Vec<i64> = window
            .events
            .iter()
            .map(|e| e.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![2, 3, 4]);
        assert!(!window.complete);
        assert_eq!(buffer.sizes(), (2, 4));
    }

    #[test]
    fn test_wildcard_replay_preserves_publish_order() {
        let buffer = ReplayBuffer::new(10);
        let start = Utc::now();
        buffer.record(&event("task.created", 1));
        buffer.record(&event("plan.created", 2));
        buffer.record(&event("task.completed", 3));

        let window = buffer.since(&TopicPattern::parse("task.*"), start);
        let topics: Vec<&str> = window.events.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["task.created", "task.completed"]);
        assert!(window.complete);

        assert_eq!(buffer.since(&TopicPattern::All, start).events.len(), 3);
    }

    #[test]
    fn test_window_before_start_is_incomplete() {
        let buffer = ReplayBuffer::new(10);
        let earlier = Utc::now() - chrono::Duration::hours(1);
        buffer.record(&event("task.created", 1));
        assert!(!buffer.since(&TopicPattern::All, earlier).complete);
    }
}

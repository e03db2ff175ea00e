use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use orchestrator_core::Event;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 处理器重试耗尽的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// `retry_count` 为已重试次数
    pub event: Event,
    pub handler: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// 死信集合，超出容量时丢弃最旧的记录并告警
pub struct DeadLetterSet {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: Mutex<usize>,
}

impl DeadLetterSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: Mutex::new(capacity.max(1)),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        *self.capacity.lock().unwrap_or_else(PoisonError::into_inner) = capacity.max(1);
    }

    pub fn push(&self, letter: DeadLetter) {
        let capacity = *self.capacity.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= capacity {
            if let Some(dropped) = entries.pop_front() {
                warn!(
                    "死信集合已满，丢弃最旧的死信: event_id={}, topic={}",
                    dropped.event.id, dropped.event.topic
                );
            }
        }
        entries.push_back(letter);
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取出某个事件的全部死信记录
    pub fn take(&self, event_id: &str) -> Vec<DeadLetter> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (taken, kept): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|l| l.event.id == event_id);
        entries.extend(kept);
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::EventDraft;
    use serde_json::json;

    fn letter(topic: &str) -> DeadLetter {
        DeadLetter {
            event: EventDraft::new(topic, json!({})).into_event(),
            handler: "h".into(),
            error: "boom".into(),
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_oldest_entry_is_evicted_at_capacity() {
        let set = DeadLetterSet::new(2);
        set.push(letter("a"));
        set.push(letter("b"));
        set.push(letter("c"));
        let topics: Vec<String> = set.list().into_iter().map(|l| l.event.topic).collect();
        assert_eq!(topics, vec!["b", "c"]);
    }

    #[test]
    fn test_take_removes_matching_event() {
        let set = DeadLetterSet::new(10);
        let first = letter("a");
        let id = first.event.id.clone();
        set.push(first);
        set.push(letter("b"));

        assert_eq!(set.take(&id).len(), 1);
        assert_eq!(set.len(), 1);
        assert!(set.take(&id).is_empty());
    }
}

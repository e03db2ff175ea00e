use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 事件主题常量
pub mod topics {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_CANCEL_REQUESTED: &str = "task.cancel_requested";
    /// 前置依赖全部完成，子任务变为可认领
    pub const TASK_READY: &str = "task.ready";
    pub const PLAN_CREATED: &str = "plan.created";
    pub const PLAN_COMPLETED: &str = "plan.completed";
    pub const PLAN_FAILED: &str = "plan.failed";
    pub const PLAN_CANCELLED: &str = "plan.cancelled";
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const BUS_DEAD_LETTER: &str = "bus.dead_letter";
}

/// 事件优先级，共5条通道，数值越小越先投递
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventPriority {
    Critical = 0,
    High = 1,
    Default = 2,
    Low = 3,
    Deferred = 4,
}

impl EventPriority {
    pub const LANES: usize = 5;

    pub const ALL: [EventPriority; 5] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Default,
        EventPriority::Low,
        EventPriority::Deferred,
    ];

    pub fn lane(&self) -> usize {
        *self as usize
    }

    pub fn from_lane(lane: i64) -> Option<Self> {
        Self::ALL.get(usize::try_from(lane).ok()?).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Critical => "CRITICAL",
            EventPriority::High => "HIGH",
            EventPriority::Default => "DEFAULT",
            EventPriority::Low => "LOW",
            EventPriority::Deferred => "DEFERRED",
        }
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Default
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(EventPriority::Critical),
            "HIGH" => Ok(EventPriority::High),
            "DEFAULT" => Ok(EventPriority::Default),
            "LOW" => Ok(EventPriority::Low),
            "DEFERRED" => Ok(EventPriority::Deferred),
            other => Err(format!("未知的事件优先级: {other}")),
        }
    }
}

/// 已发布的事件，发布后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub priority: EventPriority,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 处理器已重试的次数，仅出现在死信副本上
    pub retry_count: u32,
}

/// 待发布的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl EventDraft {
    pub fn new<S: Into<String>>(topic: S, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            priority: EventPriority::Default,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: Option<S>) -> Self {
        self.correlation_id = correlation_id.map(Into::into);
        self
    }

    pub fn into_event(self) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            topic: self.topic,
            payload: self.payload,
            priority: self.priority,
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }
}

/// 主题匹配模式：精确匹配、前缀通配 `task.*` 或全部 `*`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    All,
    /// 保存不含 `*` 的前缀，如 `task.`
    Prefix(String),
    Exact(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" || pattern.is_empty() {
            TopicPattern::All
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TopicPattern::Prefix(prefix.to_string())
        } else {
            TopicPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::All => true,
            TopicPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicPattern::Exact(exact) => exact == topic,
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::All => f.write_str("*"),
            TopicPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            TopicPattern::Exact(exact) => f.write_str(exact),
        }
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        TopicPattern::parse(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        let wildcard = TopicPattern::parse("task.*");
        assert!(wildcard.matches("task.created"));
        assert!(wildcard.matches("task.completed"));
        assert!(!wildcard.matches("plan.created"));
        assert!(!wildcard.matches("taskforce.created"));

        assert!(TopicPattern::parse("*").matches("bus.dead_letter"));

        let exact = TopicPattern::parse("task.created");
        assert!(exact.matches("task.created"));
        assert!(!exact.matches("task.created.v2"));
    }

    #[test]
    fn test_priority_lanes_are_ordered() {
        assert!(EventPriority::Critical < EventPriority::Deferred);
        for (lane, priority) in EventPriority::ALL.iter().enumerate() {
            assert_eq!(priority.lane(), lane);
            assert_eq!(EventPriority::from_lane(lane as i64), Some(*priority));
        }
        assert_eq!(EventPriority::from_lane(9), None);
    }
}

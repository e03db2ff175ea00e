use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{Event, EventStore, OrchestratorResult, TopicPattern};

use crate::database::mapping::{row_to_event, to_millis};
use crate::database::statements::{DELETE_EVENTS_BEFORE, INSERT_EVENT, SELECT_EVENTS_SINCE};
use crate::database::DatabaseManager;

/// 事件的持久化镜像
pub struct SqliteEventStore {
    db: Arc<DatabaseManager>,
}

impl SqliteEventStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }
}

fn pattern_args(pattern: &TopicPattern) -> (&'static str, &str) {
    match pattern {
        TopicPattern::All => ("all", ""),
        TopicPattern::Exact(topic) => ("exact", topic.as_str()),
        TopicPattern::Prefix(prefix) => ("prefix", prefix.as_str()),
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: &Event) -> OrchestratorResult<()> {
        self.db
            .run(|pool| async move {
                sqlx::query(INSERT_EVENT)
                    .bind(&event.id)
                    .bind(&event.topic)
                    .bind(event.payload.to_string())
                    .bind(event.priority.lane() as i64)
                    .bind(event.correlation_id.as_deref())
                    .bind(to_millis(event.timestamp))
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn since(
        &self,
        pattern: &TopicPattern,
        since: DateTime<Utc>,
        limit: u32,
    ) -> OrchestratorResult<Vec<Event>> {
        let (mode, topic) = pattern_args(pattern);
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(SELECT_EVENTS_SINCE)
                    .bind(to_millis(since))
                    .bind(mode)
                    .bind(topic)
                    .bind(i64::from(limit))
                    .fetch_all(&pool)
                    .await?;
                rows.iter().map(row_to_event).collect()
            })
            .await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<u64> {
        self.db
            .run(|pool| async move {
                let result = sqlx::query(DELETE_EVENTS_BEFORE)
                    .bind(to_millis(cutoff))
                    .execute(&pool)
                    .await?;
                Ok(result.rows_affected())
            })
            .await
    }
}

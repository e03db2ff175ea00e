//! 行映射辅助函数：毫秒时间戳与 JSON 文本列的互转

use chrono::{DateTime, Utc};
use orchestrator_core::{
    Event, EventPriority, ExecutionPlan, OrchestratorError, OrchestratorResult, Task, WorkerInfo,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> OrchestratorResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| OrchestratorError::Serialization(format!("无效的时间戳: {ms}")))
}

fn parse_json(text: &str, field: &str) -> OrchestratorResult<serde_json::Value> {
    serde_json::from_str(text)
        .map_err(|e| OrchestratorError::Serialization(format!("解析{field}失败: {e}")))
}

pub fn row_to_task(row: &SqliteRow) -> OrchestratorResult<Task> {
    let payload: String = row.try_get("payload")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(Task {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        payload: parse_json(&payload, "任务载荷")?,
        priority: row.try_get("priority")?,
        status: row.try_get("status")?,
        assignee: row.try_get("assignee")?,
        parent_plan_id: row.try_get("parent_plan_id")?,
        depends_on: Vec::new(),
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        result: result.as_deref().map(|r| parse_json(r, "任务结果")).transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

pub fn row_to_plan(row: &SqliteRow) -> OrchestratorResult<ExecutionPlan> {
    let finished_at: Option<i64> = row.try_get("finished_at")?;
    Ok(ExecutionPlan {
        id: row.try_get("id")?,
        parent_task_id: row.try_get("parent_task_id")?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        finished_at: finished_at.map(from_millis).transpose()?,
    })
}

pub fn row_to_worker(row: &SqliteRow) -> OrchestratorResult<WorkerInfo> {
    let capabilities: String = row.try_get("capabilities")?;
    Ok(WorkerInfo {
        id: row.try_get("id")?,
        capabilities: serde_json::from_str(&capabilities)?,
        status: row.try_get("status")?,
        last_heartbeat: from_millis(row.try_get("last_heartbeat")?)?,
        current_task_id: row.try_get("current_task_id")?,
        registered_at: from_millis(row.try_get("registered_at")?)?,
    })
}

pub fn row_to_event(row: &SqliteRow) -> OrchestratorResult<Event> {
    let payload: String = row.try_get("payload")?;
    let priority: i64 = row.try_get("priority")?;
    Ok(Event {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: parse_json(&payload, "事件载荷")?,
        priority: EventPriority::from_lane(priority).ok_or_else(|| {
            OrchestratorError::Serialization(format!("无效的事件优先级: {priority}"))
        })?,
        correlation_id: row.try_get("correlation_id")?,
        timestamp: from_millis(row.try_get("timestamp")?)?,
        retry_count: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip_keeps_precision() {
        let now = Utc::now();
        let restored = from_millis(to_millis(now)).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}

//! 预编译 SQL
//!
//! 所有语句都是常量字符串，经由每个连接的语句缓存只解析一次。
//! `HOT_STATEMENTS` 在连接建立时预先编译。

macro_rules! task_columns {
    () => {
        "id, task_type, payload, priority, status, assignee, parent_plan_id, \
         retry_count, max_retries, cancel_requested, result, created_at, updated_at"
    };
}

macro_rules! worker_columns {
    () => {
        "id, capabilities, status, last_heartbeat, current_task_id, registered_at"
    };
}

pub const INSERT_PLAN: &str =
    "INSERT INTO plans (id, parent_task_id, correlation_id, created_at) VALUES (?1, ?2, ?3, ?4)";

pub const INSERT_TASK: &str = concat!(
    "INSERT INTO tasks (",
    task_columns!(),
    ") VALUES (?1, ?2, ?3, ?4, 'queued', NULL, ?5, 0, ?6, 0, NULL, ?7, ?7)"
);

pub const INSERT_DEPENDENCY: &str =
    "INSERT INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)";

pub const SELECT_TASK: &str = concat!("SELECT ", task_columns!(), " FROM tasks WHERE id = ?1");

pub const SELECT_PLAN: &str =
    "SELECT id, parent_task_id, correlation_id, created_at, finished_at FROM plans WHERE id = ?1";

pub const SELECT_PLAN_TASKS: &str = concat!(
    "SELECT ",
    task_columns!(),
    " FROM tasks WHERE parent_plan_id = ?1 ORDER BY created_at ASC, rowid ASC"
);

/// ?1 为任务ID的 JSON 数组
pub const SELECT_DEPENDENCIES: &str = "SELECT task_id, depends_on_id FROM task_dependencies \
     WHERE task_id IN (SELECT value FROM json_each(?1)) ORDER BY rowid ASC";

/// 原子认领
///
/// ?1 worker_id，?2 能力集合的 JSON 数组（`*` 匹配任意类型），?3 当前毫秒时间。
/// 子查询挑选优先级最高、最早创建、依赖全部完成的 queued 任务；外层的
/// `status = 'queued'` 让更新只在行仍未被认领时生效。
pub const CLAIM_NEXT_TASK: &str = concat!(
    "UPDATE tasks SET status = 'assigned', assignee = ?1, updated_at = ?3 \
     WHERE id = ( \
         SELECT t.id FROM tasks t \
         WHERE t.status = 'queued' \
           AND EXISTS (SELECT 1 FROM json_each(?2) c WHERE c.value = '*' OR c.value = t.task_type) \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies d JOIN tasks dep ON dep.id = d.depends_on_id \
               WHERE d.task_id = t.id AND dep.status != 'completed') \
         ORDER BY t.priority DESC, t.created_at ASC, t.rowid ASC \
         LIMIT 1) \
       AND status = 'queued' \
     RETURNING ",
    task_columns!()
);

/// 条件状态更新
///
/// ?1 task_id，?2 目标状态，?3 结果 JSON（可空），?4 当前毫秒时间，
/// ?5 允许的源状态 JSON 数组。失败且仍有重试次数、未被请求取消时回到 queued 并累加
/// retry_count；只有进入 running 时保留 assignee。
pub const UPDATE_TASK_STATUS: &str = concat!(
    "UPDATE tasks SET \
         status = CASE WHEN ?2 = 'failed' AND retry_count < max_retries AND cancel_requested = 0 \
                       THEN 'queued' ELSE ?2 END, \
         retry_count = CASE WHEN ?2 = 'failed' AND retry_count < max_retries AND cancel_requested = 0 \
                            THEN retry_count + 1 ELSE retry_count END, \
         assignee = CASE WHEN ?2 = 'running' THEN assignee ELSE NULL END, \
         result = COALESCE(?3, result), \
         updated_at = ?4 \
     WHERE id = ?1 AND status IN (SELECT value FROM json_each(?5)) \
     RETURNING ",
    task_columns!()
);

pub const REQUEST_CANCEL: &str = concat!(
    "UPDATE tasks SET \
         status = CASE WHEN status = 'running' THEN status ELSE 'cancelled' END, \
         assignee = CASE WHEN status = 'running' THEN assignee ELSE NULL END, \
         cancel_requested = CASE WHEN status = 'running' THEN 1 ELSE cancel_requested END, \
         updated_at = ?2 \
     WHERE id = ?1 AND status IN ('queued', 'assigned', 'running') \
     RETURNING ",
    task_columns!()
);

pub const RELEASE_TASK: &str = concat!(
    "UPDATE tasks SET status = 'queued', assignee = NULL, updated_at = ?3 \
     WHERE id = ?1 AND assignee = ?2 AND status = 'assigned' \
     RETURNING ",
    task_columns!()
);

/// 已被请求取消的任务直接取消，其余回到 queued
pub const RECLAIM_WORKER_TASKS: &str = concat!(
    "UPDATE tasks SET \
         status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'queued' END, \
         assignee = NULL, \
         updated_at = ?2 \
     WHERE assignee = ?1 AND status IN ('assigned', 'running') \
     RETURNING ",
    task_columns!()
);

pub const SELECT_READY_DEPENDENTS: &str = concat!(
    "SELECT ",
    task_columns!(),
    " FROM tasks \
     WHERE id IN (SELECT d.task_id FROM task_dependencies d WHERE d.depends_on_id = ?1) \
       AND status = 'queued' \
       AND NOT EXISTS ( \
           SELECT 1 FROM task_dependencies d2 JOIN tasks dep ON dep.id = d2.depends_on_id \
           WHERE d2.task_id = tasks.id AND dep.status != 'completed') \
     ORDER BY priority DESC, created_at ASC, rowid ASC"
);

pub const MARK_PLAN_FINISHED: &str =
    "UPDATE plans SET finished_at = ?2 WHERE id = ?1 AND finished_at IS NULL";

pub const COUNT_TASKS_BY_STATUS: &str = "SELECT status, COUNT(*) AS n FROM tasks GROUP BY status";

pub const UPSERT_WORKER: &str = concat!(
    "INSERT INTO workers (id, capabilities, status, last_heartbeat, current_task_id, registered_at) \
     VALUES (?1, ?2, 'idle', ?3, NULL, ?3) \
     ON CONFLICT(id) DO UPDATE SET \
         capabilities = excluded.capabilities, \
         status = 'idle', \
         last_heartbeat = excluded.last_heartbeat, \
         current_task_id = NULL \
     RETURNING ",
    worker_columns!()
);

/// 上报 idle 时清空当前任务
pub const HEARTBEAT_WORKER: &str = concat!(
    "UPDATE workers SET \
         last_heartbeat = ?3, \
         status = ?2, \
         current_task_id = CASE WHEN ?2 = 'idle' THEN NULL ELSE current_task_id END \
     WHERE id = ?1 RETURNING ",
    worker_columns!()
);

pub const SELECT_WORKER: &str = concat!("SELECT ", worker_columns!(), " FROM workers WHERE id = ?1");

/// ?1 存活下限（毫秒），?2 能力过滤（可空）
pub const LIST_ACTIVE_WORKERS: &str = concat!(
    "SELECT ",
    worker_columns!(),
    " FROM workers \
     WHERE status != 'offline' AND last_heartbeat >= ?1 \
       AND (?2 IS NULL OR EXISTS ( \
           SELECT 1 FROM json_each(workers.capabilities) c WHERE c.value = ?2 OR c.value = '*')) \
     ORDER BY last_heartbeat DESC, id ASC"
);

pub const MARK_STALE_WORKERS_OFFLINE: &str = concat!(
    "UPDATE workers SET status = 'offline', current_task_id = NULL \
     WHERE status != 'offline' AND last_heartbeat < ?1 \
     RETURNING ",
    worker_columns!()
);

/// 已离线却仍持有 assigned / running 任务的 Worker
pub const SELECT_OFFLINE_TASK_HOLDERS: &str = "SELECT DISTINCT t.assignee AS worker_id \
     FROM tasks t JOIN workers w ON w.id = t.assignee \
     WHERE t.status IN ('assigned', 'running') AND w.status = 'offline' \
     ORDER BY t.assignee ASC";

pub const SET_WORKER_CURRENT_TASK: &str = "UPDATE workers SET \
         current_task_id = ?2, \
         status = CASE WHEN ?2 IS NULL THEN 'idle' ELSE 'active' END \
     WHERE id = ?1 AND status != 'offline'";

pub const COUNT_WORKERS_BY_STATUS: &str =
    "SELECT status, COUNT(*) AS n FROM workers GROUP BY status";

pub const INSERT_EVENT: &str = "INSERT INTO events \
     (id, topic, payload, priority, correlation_id, timestamp) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// ?1 起始毫秒时间，?2 匹配方式（all / exact / prefix），?3 主题或前缀，?4 条数上限
pub const SELECT_EVENTS_SINCE: &str = "SELECT id, topic, payload, priority, correlation_id, timestamp \
     FROM events \
     WHERE timestamp >= ?1 \
       AND (?2 = 'all' \
            OR (?2 = 'exact' AND topic = ?3) \
            OR (?2 = 'prefix' AND substr(topic, 1, length(?3)) = ?3)) \
     ORDER BY timestamp ASC, seq ASC \
     LIMIT ?4";

pub const DELETE_EVENTS_BEFORE: &str = "DELETE FROM events WHERE timestamp < ?1";

/// 建立连接后预先编译的热点语句
pub const HOT_STATEMENTS: &[&str] = &[
    CLAIM_NEXT_TASK,
    UPDATE_TASK_STATUS,
    INSERT_EVENT,
    HEARTBEAT_WORKER,
    SELECT_TASK,
];

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use orchestrator_core::config::models::DatabaseConfig;
use orchestrator_core::{CircuitBreaker, OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::{debug, info, instrument, warn};

use super::statements::HOT_STATEMENTS;

/// 语句参数
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    /// 以 JSON 文本存储
    Json(serde_json::Value),
}

impl SqlValue {
    fn bind<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Integer(v) => query.bind(v),
            SqlValue::Real(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Json(v) => query.bind(v.to_string()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// 批处理中的一条语句
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new<S: Into<String>>(sql: S) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind<V: Into<SqlValue>>(mut self, value: V) -> Self {
        self.params.push(value.into());
        self
    }
}

fn build_query(sql: &str, params: Vec<SqlValue>) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    params
        .into_iter()
        .fold(sqlx::query(sql), |query, param| param.bind(query))
}

/// 连接池状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

/// 持久化层：连接池 + 熔断器
///
/// 每个对外调用都经过熔断器；连接池耗尽时最多等待 `acquire_timeout`，
/// 写锁冲突时最多等待 `busy_timeout`，两者超时都归类为瞬时错误。
///
/// 事务请以写语句开头：SQLite 在 WAL 模式下把读事务升级为写事务可能直接返回 BUSY。
pub struct DatabaseManager {
    pool: SqlitePool,
    breaker: CircuitBreaker,
    max_connections: u32,
}

impl DatabaseManager {
    /// 建立连接池并执行迁移
    ///
    /// `sqlite::memory:` 在多连接下每个连接是独立的库，测试请使用临时文件。
    pub async fn connect(
        config: &DatabaseConfig,
        breaker: CircuitBreaker,
    ) -> OrchestratorResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
            .statement_cache_capacity(config.statement_cache_capacity);

        // 迁移完成前表不存在，预编译只对之后建立的连接生效
        let schema_ready = Arc::new(AtomicBool::new(false));
        let ready = schema_ready.clone();

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .after_connect(move |conn, _meta| {
                let ready = ready.load(Ordering::Acquire);
                Box::pin(async move {
                    if ready {
                        prepare_hot_statements(conn).await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        let manager = Self {
            pool,
            breaker,
            max_connections: config.max_connections,
        };
        manager.migrate().await?;
        schema_ready.store(true, Ordering::Release);

        let mut conn = manager.pool.acquire().await?;
        prepare_hot_statements(&mut conn).await?;

        info!(
            "数据库连接池已建立: max_connections={}, busy_timeout={:?}",
            config.max_connections,
            config.busy_timeout()
        );
        Ok(manager)
    }

    /// 运行数据库迁移
    pub async fn migrate(&self) -> OrchestratorResult<()> {
        debug!("Running SQLite database migrations");
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_connections: self.max_connections,
        }
    }

    /// 在熔断器保护下使用连接池执行任意操作
    pub async fn run<T, F, Fut>(&self, operation: F) -> OrchestratorResult<T>
    where
        F: FnOnce(SqlitePool) -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let pool = self.pool.clone();
        self.breaker.execute(|| operation(pool)).await
    }

    /// 执行单条语句并返回结果行
    #[instrument(skip(self, params), fields(sql = %sql))]
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> OrchestratorResult<Vec<SqliteRow>> {
        self.run(|pool| async move {
            let rows = build_query(sql, params).fetch_all(&pool).await?;
            Ok(rows)
        })
        .await
    }

    /// 在一个事务内依次执行，返回每条语句影响的行数；任一失败整体回滚
    #[instrument(skip(self, statements), fields(count = statements.len()))]
    pub async fn execute_batch(&self, statements: Vec<Statement>) -> OrchestratorResult<Vec<u64>> {
        self.transaction(move |conn| {
            Box::pin(async move {
                let mut affected = Vec::with_capacity(statements.len());
                for statement in statements {
                    let result = build_query(&statement.sql, statement.params)
                        .execute(&mut *conn)
                        .await?;
                    affected.push(result.rows_affected());
                }
                Ok::<_, OrchestratorError>(affected)
            })
        })
        .await
    }

    /// 作用域事务：闭包返回 `Ok` 时提交，返回 `Err` 时回滚；
    /// 闭包 panic 时事务随连接归还被回滚。
    pub async fn transaction<T, F>(&self, f: F) -> OrchestratorResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, OrchestratorResult<T>>
            + Send,
    {
        self.run(|pool| async move {
            let mut tx = pool.begin().await?;
            match f(&mut *tx).await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!("事务回滚失败: {}", rollback_err);
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    pub async fn health_check(&self) -> OrchestratorResult<()> {
        self.execute("SELECT 1", Vec::new()).await.map(|_| ())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

async fn prepare_hot_statements(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for sql in HOT_STATEMENTS {
        (&mut *conn).prepare(sql).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::CircuitState;
    use sqlx::Row;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, DatabaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("test.db").display()),
            ..Default::default()
        };
        let db = DatabaseManager::connect(&config, CircuitBreaker::new())
            .await
            .unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_health_check_and_migrations() {
        let (_dir, db) = setup().await;
        db.health_check().await.unwrap();

        let rows = db
            .execute(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                vec!["tasks".into()],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(db.breaker().state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_batch_is_all_or_nothing() {
        let (_dir, db) = setup().await;
        let insert = "INSERT INTO plans (id, correlation_id, created_at) VALUES (?1, ?1, 0)";

        let result = db
            .execute_batch(vec![
                Statement::new(insert).bind("p1"),
                Statement::new(insert).bind("p2"),
                Statement::new(insert).bind("p1"),
            ])
            .await;
        assert!(matches!(result, Err(OrchestratorError::Conflict(_))));

        let rows = db
            .execute("SELECT COUNT(*) AS n FROM plans", Vec::new())
            .await
            .unwrap();
        assert_eq!(rows[0].get::<i64, _>("n"), 0);

        let affected = db
            .execute_batch(vec![
                Statement::new(insert).bind("p1"),
                Statement::new(insert).bind("p2"),
            ])
            .await
            .unwrap();
        assert_eq!(affected, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let (_dir, db) = setup().await;

        let result: OrchestratorResult<()> = db
            .transaction(|conn| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO plans (id, correlation_id, created_at) VALUES ('p', 'c', 0)",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Err(OrchestratorError::validation("abort"))
                })
            })
            .await;
        assert!(result.is_err());

        let rows = db
            .execute("SELECT id FROM plans", Vec::new())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_panic() {
        let (_dir, db) = setup().await;
        let db = Arc::new(db);

        let worker = db.clone();
        let crash = true;
        let joined = tokio::spawn(async move {
            let _: OrchestratorResult<()> = worker
                .transaction(move |conn| {
                    Box::pin(async move {
                        sqlx::query(
                            "INSERT INTO plans (id, correlation_id, created_at) VALUES ('p', 'c', 0)",
                        )
                        .execute(&mut *conn)
                        .await?;
                        if !crash {
                            return Ok(());
                        }
                        panic!("handler crashed");
                    })
                })
                .await;
        })
        .await;
        assert!(joined.is_err());

        let rows = db
            .execute("SELECT id FROM plans", Vec::new())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_key_is_conflict_and_does_not_trip_breaker() {
        let (_dir, db) = setup().await;
        let insert = "INSERT INTO plans (id, correlation_id, created_at) VALUES (?1, ?1, 0)";
        db.execute(insert, vec!["dup".into()]).await.unwrap();
        for _ in 0..6 {
            let result = db.execute(insert, vec!["dup".into()]).await;
            assert!(matches!(result, Err(OrchestratorError::Conflict(_))));
        }
        assert_eq!(db.breaker().state().await, CircuitState::Closed);
    }
}

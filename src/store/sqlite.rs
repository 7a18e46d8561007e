//! SQLite 持久化实现
//!
//! 底层为同步的 rusqlite 连接（Mutex 保护），异步接口通过 spawn_blocking
//! 桥接；请求日志经有界 channel 送入后台任务批量写入，热路径不等待磁盘。

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::mpsc;

use super::{
    GatewayStats, LogListResponse, LogQuery, ModelStats, RequestLog, TaskListResponse, TaskQuery,
    TaskRecord, TaskStatus, TaskStore, TaskUpdate,
};

/// 底层 SQLite 存储（同步）
struct SqliteStore {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteStore {
    fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                modality TEXT NOT NULL,
                status TEXT NOT NULL,
                request_id TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt TEXT NOT NULL,
                source_media TEXT,
                result_url TEXT,
                error TEXT,
                credential_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                processing_time_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                request_id TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                credential_id INTEGER,
                processing_time_ms INTEGER NOT NULL DEFAULT 0,
                request_size INTEGER NOT NULL DEFAULT 0,
                response_size INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON request_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_logs_model ON request_logs(model);
            CREATE INDEX IF NOT EXISTS idx_logs_status ON request_logs(status);",
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn create_task(&self, task: &TaskRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, modality, status, request_id, model, prompt, source_media, result_url, error, credential_id, created_at, completed_at, processing_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                task.id,
                task.modality,
                task.status.as_str(),
                task.request_id,
                task.model,
                task.prompt,
                task.source_media,
                task.result_url,
                task.error,
                task.credential_id as i64,
                task.created_at.to_rfc3339(),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.processing_time_ms,
            ],
        )?;
        Ok(())
    }

    fn update_task_status(&self, task_id: &str, update: &TaskUpdate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // 终态任务不再更新（状态只能向前推进）
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, result_url = COALESCE(?3, result_url),
                 error = COALESCE(?4, error), completed_at = COALESCE(?5, completed_at),
                 processing_time_ms = COALESCE(?6, processing_time_ms)
             WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
            rusqlite::params![
                task_id,
                update.status.as_str(),
                update.result_url,
                update.error,
                update.completed_at.map(|t| t.to_rfc3339()),
                update.processing_time_ms,
            ],
        )?;
        if changed == 0 {
            tracing::warn!("任务状态更新被忽略（不存在或已终态）: task_id={}", task_id);
        }
        Ok(())
    }

    fn insert_logs_batch(&self, logs: &[RequestLog]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        for log in logs {
            tx.execute(
                "INSERT INTO request_logs (timestamp, request_id, model, status, credential_id, processing_time_ms, request_size, response_size, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    log.timestamp.to_rfc3339(),
                    log.request_id,
                    log.model,
                    log.status,
                    log.credential_id.map(|id| id as i64),
                    log.processing_time_ms,
                    log.request_size,
                    log.response_size,
                    log.error,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_tasks(&self, query: &TaskQuery) -> Result<TaskListResponse> {
        let conn = self.conn.lock().unwrap();
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query.page_size.unwrap_or(50).clamp(1, 200);
        let offset = (page - 1) * page_size;

        let mut where_clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = query.status {
            where_clauses.push(format!("status = ?{}", params.len() + 1));
            params.push(Box::new(status.clone()));
        }
        if let Some(ref modality) = query.modality {
            where_clauses.push(format!("modality = ?{}", params.len() + 1));
            params.push(Box::new(modality.clone()));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM tasks {}", where_sql);
        let total: u64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;

        let query_sql = format!(
            "SELECT id, modality, status, request_id, model, prompt, source_media, result_url, error, credential_id, created_at, completed_at, processing_time_ms
             FROM tasks {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_sql,
            params.len() + 1,
            params.len() + 2
        );
        params.push(Box::new(page_size as i64));
        params.push(Box::new(offset as i64));

        let mut stmt = conn.prepare(&query_sql)?;
        let tasks = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| {
                    let status: String = row.get(2)?;
                    let created_at: String = row.get(10)?;
                    let completed_at: Option<String> = row.get(11)?;
                    Ok(TaskRecord {
                        id: row.get(0)?,
                        modality: row.get(1)?,
                        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
                        request_id: row.get(3)?,
                        model: row.get(4)?,
                        prompt: row.get(5)?,
                        source_media: row.get(6)?,
                        result_url: row.get(7)?,
                        error: row.get(8)?,
                        credential_id: row.get::<_, i64>(9)? as u64,
                        created_at: parse_timestamp(&created_at),
                        completed_at: completed_at.as_deref().map(parse_timestamp),
                        processing_time_ms: row.get(12)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(TaskListResponse {
            total,
            page,
            page_size,
            tasks,
        })
    }

    fn list_logs(&self, query: &LogQuery) -> Result<LogListResponse> {
        let conn = self.conn.lock().unwrap();
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query.page_size.unwrap_or(50).clamp(1, 200);
        let offset = (page - 1) * page_size;

        let mut where_clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref model) = query.model {
            where_clauses.push(format!("model = ?{}", params.len() + 1));
            params.push(Box::new(model.clone()));
        }
        if let Some(ref status) = query.status {
            where_clauses.push(format!("status = ?{}", params.len() + 1));
            params.push(Box::new(status.clone()));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM request_logs {}", where_sql);
        let total: u64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;

        let query_sql = format!(
            "SELECT timestamp, request_id, model, status, credential_id, processing_time_ms, request_size, response_size, error
             FROM request_logs {} ORDER BY id DESC LIMIT ?{} OFFSET ?{}",
            where_sql,
            params.len() + 1,
            params.len() + 2
        );
        params.push(Box::new(page_size as i64));
        params.push(Box::new(offset as i64));

        let mut stmt = conn.prepare(&query_sql)?;
        let logs = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| {
                    let timestamp: String = row.get(0)?;
                    let credential_id: Option<i64> = row.get(4)?;
                    Ok(RequestLog {
                        timestamp: parse_timestamp(&timestamp),
                        request_id: row.get(1)?,
                        model: row.get(2)?,
                        status: row.get(3)?,
                        credential_id: credential_id.map(|id| id as u64),
                        processing_time_ms: row.get(5)?,
                        request_size: row.get(6)?,
                        response_size: row.get(7)?,
                        error: row.get(8)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(LogListResponse {
            total,
            page,
            page_size,
            logs,
        })
    }

    fn aggregate_stats(&self) -> Result<GatewayStats> {
        let conn = self.conn.lock().unwrap();

        let (total_requests, error_count, avg_processing_ms): (u64, u64, f64) = conn.query_row(
            "SELECT COUNT(*), COUNT(CASE WHEN status != 'completed' THEN 1 END), COALESCE(AVG(processing_time_ms), 0) FROM request_logs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let error_rate = if total_requests > 0 {
            error_count as f64 / total_requests as f64
        } else {
            0.0
        };

        let mut stmt = conn.prepare(
            "SELECT model, COUNT(*), COUNT(CASE WHEN status != 'completed' THEN 1 END), COALESCE(AVG(processing_time_ms), 0)
             FROM request_logs GROUP BY model ORDER BY COUNT(*) DESC",
        )?;
        let models = stmt
            .query_map([], |row| {
                Ok(ModelStats {
                    model: row.get(0)?,
                    count: row.get(1)?,
                    error_count: row.get(2)?,
                    avg_processing_ms: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(GatewayStats {
            total_requests,
            error_count,
            error_rate,
            avg_processing_ms,
            models,
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite 任务存储（公开 API）
pub struct SqliteTaskStore {
    store: Arc<SqliteStore>,
    log_sender: mpsc::Sender<RequestLog>,
}

impl SqliteTaskStore {
    /// 打开数据库并启动后台日志写入任务
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(db_path)?);
        let (log_sender, mut receiver) = mpsc::channel::<RequestLog>(10_000);

        let write_store = store.clone();
        tokio::spawn(async move {
            while let Some(first) = receiver.recv().await {
                // 把当前可取的记录合并为一批
                let mut batch = vec![first];
                while let Ok(log) = receiver.try_recv() {
                    batch.push(log);
                    if batch.len() >= 500 {
                        break;
                    }
                }
                let store = write_store.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    if let Err(e) = store.insert_logs_batch(&batch) {
                        tracing::error!("批量写入请求日志失败: {}", e);
                    }
                })
                .await;
            }
        });

        Ok(Self { store, log_sender })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(&self, task: &TaskRecord) -> Result<()> {
        let store = self.store.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || store.create_task(&task)).await?
    }

    async fn update_task_status(&self, task_id: &str, update: TaskUpdate) -> Result<()> {
        let store = self.store.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || store.update_task_status(&task_id, &update)).await?
    }

    fn append_log(&self, log: RequestLog) {
        if self.log_sender.try_send(log).is_err() {
            tracing::warn!("请求日志通道已满，丢弃记录");
        }
    }

    async fn list_tasks(&self, query: TaskQuery) -> Result<TaskListResponse> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_tasks(&query)).await?
    }

    async fn list_logs(&self, query: LogQuery) -> Result<LogListResponse> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_logs(&query)).await?
    }

    async fn aggregate_stats(&self) -> Result<GatewayStats> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.aggregate_stats()).await?
    }
}

//! 持久化端口
//!
//! 任务与请求日志的存取接口。编排器只依赖 [`TaskStore`] trait，
//! 生产实现为 SQLite，测试注入内存替身。

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteTaskStore;

/// 任务状态，只能向前推进，终态不可变更
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// 任务记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    /// image 或 video
    pub modality: String,
    pub status: TaskStatus,
    pub request_id: String,
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_media: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub credential_id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
}

/// 任务终态更新
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
}

/// 请求日志，追加写入，每个请求无论结果如何恰好写一条
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub model: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<u64>,
    pub processing_time_ms: i64,
    pub request_size: i64,
    pub response_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 任务查询条件
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub status: Option<String>,
    pub modality: Option<String>,
}

/// 日志查询条件
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub model: Option<String>,
    pub status: Option<String>,
}

/// 任务列表响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListResponse {
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub tasks: Vec<TaskRecord>,
}

/// 日志列表响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogListResponse {
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub logs: Vec<RequestLog>,
}

/// 按模型汇总
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    pub model: String,
    pub count: u64,
    pub error_count: u64,
    pub avg_processing_ms: f64,
}

/// 聚合统计
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_processing_ms: f64,
    pub models: Vec<ModelStats>,
}

/// 任务与请求日志的持久化端口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 创建任务记录
    async fn create_task(&self, task: &TaskRecord) -> anyhow::Result<()>;

    /// 更新任务状态。状态只能向前推进，对终态任务的更新会被忽略
    async fn update_task_status(&self, task_id: &str, update: TaskUpdate) -> anyhow::Result<()>;

    /// 追加请求日志（非阻塞，后台批量落库）
    fn append_log(&self, log: RequestLog);

    /// 查询任务列表
    async fn list_tasks(&self, query: TaskQuery) -> anyhow::Result<TaskListResponse>;

    /// 查询请求日志
    async fn list_logs(&self, query: LogQuery) -> anyhow::Result<LogListResponse>;

    /// 聚合统计
    async fn aggregate_stats(&self) -> anyhow::Result<GatewayStats>;
}

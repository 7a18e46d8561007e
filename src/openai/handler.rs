//! OpenAI 兼容端点与路由
//!
//! 传输层：认证、请求解析、流式（SSE）与非流式响应的封帧。
//! 编排逻辑全部在 [`RequestOrchestrator`]，这里只负责搬运帧。

use std::convert::Infallible;
use std::sync::Arc;

use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cache::ArtifactCache;
use crate::catalog;
use crate::common::auth;
use crate::orchestrator::{FRAME_CHANNEL_CAPACITY, RequestOrchestrator};
use crate::store::{LogQuery, TaskQuery, TaskStore};
use crate::token::{AdmissionController, CredentialPatch, CredentialPool};

use super::types::{
    ChatCompletionChunk, ChatCompletionResponse, ChatRequest, ErrorResponse, Model, ModelsResponse,
};

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 网关 API 密钥（未配置时不启用认证）
    pub api_key: Option<String>,
    pub orchestrator: Arc<RequestOrchestrator>,
    pub store: Arc<dyn TaskStore>,
    pub cache: Arc<ArtifactCache>,
    pub pool: Arc<CredentialPool>,
    pub admission: Arc<AdmissionController>,
    /// 新增凭据使用的并发额度
    pub concurrency_budget: u32,
}

/// API Key 认证中间件
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(ref expected) = state.api_key else {
        return next.run(request).await;
    };
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, expected) => next.run(request).await,
        _ => {
            let error = ErrorResponse::authentication_error();
            (StatusCode::UNAUTHORIZED, Json(error)).into_response()
        }
    }
}

/// CORS 中间件层（公开 API 服务，允许任意来源）
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/tasks", get(list_tasks))
        .route("/v1/logs", get(list_logs))
        .route("/v1/stats", get(stats))
        .route("/v1/credentials", get(list_credentials).post(add_credential))
        .route(
            "/v1/credentials/{id}",
            axum::routing::patch(update_credential).delete(delete_credential),
        )
        .route("/v1/settings", post(update_settings))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .route("/health", get(health))
        .layer(cors_layer())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// GET /v1/models
async fn list_models() -> Json<ModelsResponse> {
    let data = catalog::MODELS
        .iter()
        .map(|spec| Model {
            id: spec.name.to_string(),
            object: "model".to_string(),
            created: Utc::now().timestamp(),
            owned_by: "pixgate".to_string(),
        })
        .collect();
    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

/// POST /v1/chat/completions
async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let request_size = body.len();
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            let error = ErrorResponse::new("invalid_request_error", format!("请求体解析失败: {}", e));
            return (StatusCode::BAD_REQUEST, Json(error)).into_response();
        }
    };

    if request.stream {
        stream_response(state, request, request_size)
    } else {
        json_response(state, request, request_size).await
    }
}

/// 流式响应：编排器在独立任务中运行（调用方断开不影响收尾），
/// 帧经有界 channel 转为 SSE，终止后补发 [DONE] 哨兵
fn stream_response(state: AppState, request: ChatRequest, request_size: usize) -> Response {
    let (tx, rx) = mpsc::channel::<ChatCompletionChunk>(FRAME_CHANNEL_CAPACITY);

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let _ = orchestrator.run(request, request_size, tx).await;
    });

    let stream = futures::stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        match rx.recv().await {
            Some(frame) => {
                let data = serde_json::to_string(&frame).unwrap_or_default();
                Some((
                    Ok::<_, Infallible>(Bytes::from(format!("data: {}\n\n", data))),
                    (rx, false),
                ))
            }
            // channel 关闭说明终止帧已发出，补发哨兵后结束
            None => Some((Ok(Bytes::from("data: [DONE]\n\n")), (rx, true))),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// 非流式响应：内联运行编排器，取终止帧转换为单个 JSON 对象
async fn json_response(state: AppState, request: ChatRequest, request_size: usize) -> Response {
    let (tx, mut rx) = mpsc::channel::<ChatCompletionChunk>(FRAME_CHANNEL_CAPACITY);

    let outcome = state.orchestrator.run(request, request_size, tx).await;

    // 取最后一帧（终止帧）
    let mut terminal = None;
    while let Ok(frame) = rx.try_recv() {
        terminal = Some(frame);
    }

    match outcome {
        Ok(_) => match terminal {
            Some(frame) => Json(ChatCompletionResponse::from_terminal_chunk(&frame)).into_response(),
            None => {
                let error = ErrorResponse::new("internal_error", "缺少终止帧");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
            }
        },
        Err(e) => {
            let error = ErrorResponse::new(e.log_status(), e.to_string());
            (e.status_code(), Json(error)).into_response()
        }
    }
}

/// GET /v1/tasks
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Response {
    match state.store.list_tasks(query).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            tracing::error!("任务查询失败: {}", e);
            let error = ErrorResponse::new("internal_error", e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}

/// GET /v1/logs
async fn list_logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    match state.store.list_logs(query).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            tracing::error!("日志查询失败: {}", e);
            let error = ErrorResponse::new("internal_error", e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}

// === 凭据管理 ===

/// 凭据状态项（不含 secret）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialStatusItem {
    id: u64,
    label: String,
    enabled: bool,
    in_use: u32,
    budget: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// 添加凭据请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddCredentialRequest {
    label: String,
    secret: String,
}

/// GET /v1/credentials
async fn list_credentials(State(state): State<AppState>) -> Json<Vec<CredentialStatusItem>> {
    let snapshot = state.admission.snapshot();
    let items = state
        .pool
        .list()
        .into_iter()
        .map(|cred| {
            let slot = snapshot
                .entries
                .iter()
                .find(|e| e.credential_id == cred.id);
            CredentialStatusItem {
                id: cred.id,
                label: cred.label,
                enabled: cred.enabled,
                in_use: slot.map(|s| s.in_use).unwrap_or(0),
                budget: slot.map(|s| s.budget).unwrap_or(0),
                created_at: cred.created_at,
                updated_at: cred.updated_at,
            }
        })
        .collect();
    Json(items)
}

/// POST /v1/credentials
async fn add_credential(
    State(state): State<AppState>,
    Json(req): Json<AddCredentialRequest>,
) -> Response {
    match state.pool.add(req.label, req.secret) {
        Ok(id) => {
            state.admission.track(id, state.concurrency_budget);
            tracing::info!("凭据已添加: id={}", id);
            (StatusCode::CREATED, Json(serde_json::json!({"id": id}))).into_response()
        }
        Err(e) => {
            let error = ErrorResponse::new("internal_error", e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}

/// PATCH /v1/credentials/{id}
async fn update_credential(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(patch): Json<CredentialPatch>,
) -> Response {
    match state.pool.update(id, patch) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            let error = ErrorResponse::new("not_found", e.to_string());
            (StatusCode::NOT_FOUND, Json(error)).into_response()
        }
    }
}

/// DELETE /v1/credentials/{id}
async fn delete_credential(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.pool.remove(id) {
        Ok(()) => {
            state.admission.untrack(id);
            tracing::info!("凭据已删除: id={}", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            let error = ErrorResponse::new("not_found", e.to_string());
            (StatusCode::NOT_FOUND, Json(error)).into_response()
        }
    }
}

// === 运行时设置 ===

/// 运行时可调整的设置，缺省字段保持不变
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsRequest {
    concurrency_budget: Option<u32>,
    cache_ttl_secs: Option<u64>,
}

/// POST /v1/settings —— 对持有组件做显式 setter 调用，不持久化
async fn update_settings(
    State(state): State<AppState>,
    Json(req): Json<SettingsRequest>,
) -> StatusCode {
    if let Some(budget) = req.concurrency_budget {
        state.admission.set_budget(budget);
    }
    if let Some(ttl_secs) = req.cache_ttl_secs {
        state.cache.set_ttl(Duration::from_secs(ttl_secs));
    }
    StatusCode::NO_CONTENT
}

/// GET /v1/stats —— 聚合统计 + 缓存与准入观测
async fn stats(State(state): State<AppState>) -> Response {
    match state.store.aggregate_stats().await {
        Ok(stats) => Json(serde_json::json!({
            "requests": stats,
            "cache": state.cache.stats(),
            "admission": state.admission.snapshot(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("统计查询失败: {}", e);
            let error = ErrorResponse::new("internal_error", e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}

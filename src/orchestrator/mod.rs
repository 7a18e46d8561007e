//! 请求编排
//!
//! 每个入站请求一台状态机：PENDING → PROCESSING → {COMPLETED, FAILED}。
//! 负责凭据获取与保证释放、上游调用选择、种子素材缓存、进度帧投递，
//! 以及无论结果如何都恰好写一条请求日志。

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::ArtifactCache;
use crate::catalog::{self, Modality};
use crate::common::truncate_with_ellipsis;
use crate::error::GatewayError;
use crate::openai::types::{ChatCompletionChunk, ChatRequest, SeedMedia};
use crate::store::{RequestLog, TaskRecord, TaskStatus, TaskStore, TaskUpdate};
use crate::token::Dispatcher;
use crate::upstream::UpstreamClient;

/// 进度帧通道容量（有界，防止慢消费者拖垮内存）
pub const FRAME_CHANNEL_CAPACITY: usize = 32;

/// 请求编排器
///
/// 自身无请求级状态，可在所有请求间共享；每次 [`run`](Self::run)
/// 调用对应一个请求的完整生命周期
pub struct RequestOrchestrator {
    dispatcher: Arc<Dispatcher>,
    upstream: Arc<dyn UpstreamClient>,
    cache: Arc<ArtifactCache>,
    store: Arc<dyn TaskStore>,
}

impl RequestOrchestrator {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        upstream: Arc<dyn UpstreamClient>,
        cache: Arc<ArtifactCache>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            dispatcher,
            upstream,
            cache,
            store,
        }
    }

    /// 处理一个请求
    ///
    /// 进度帧按产生顺序发送到 `tx`，终止帧保证是最后一帧；
    /// 无论哪条分支，结尾都会释放已获取的凭据（恰好一次，未获取则跳过）
    /// 并追加恰好一条请求日志。调用方断开不影响收尾逻辑执行。
    /// 返回值供非流式传输层决定响应状态，流式调用方可忽略
    pub async fn run(
        &self,
        request: ChatRequest,
        request_size: usize,
        tx: mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<String, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut credential_id: Option<u64> = None;
        let mut task_id: Option<String> = None;

        let outcome = self
            .execute(&request, &request_id, &mut credential_id, &mut task_id, &tx)
            .await;

        // === 收尾：任务终态、终止帧、请求日志（每条分支都经过这里）===
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let (log_status, content, error) = match &outcome {
            Ok(url) => ("completed".to_string(), url.clone(), None),
            Err(e) => (e.log_status().to_string(), e.to_string(), Some(e.to_string())),
        };

        if let Some(ref task_id) = task_id {
            let status = if outcome.is_ok() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            let update = TaskUpdate {
                status,
                result_url: outcome.as_ref().ok().cloned(),
                error: error.clone(),
                completed_at: Some(Utc::now()),
                processing_time_ms: Some(elapsed_ms),
            };
            if let Err(e) = self.store.update_task_status(task_id, update).await {
                tracing::error!("任务终态写入失败: task_id={}, error={}", task_id, e);
            }
        }

        // 成功与失败使用同一种帧结构
        let terminal = ChatCompletionChunk::terminal(&request_id, &request.model, content);
        let response_size = serde_json::to_string(&terminal)
            .map(|s| s.len() as i64)
            .unwrap_or(0);
        // 调用方可能已断开，发送失败不影响收尾
        let _ = tx.send(terminal).await;

        self.store.append_log(RequestLog {
            timestamp: Utc::now(),
            request_id: request_id.clone(),
            model: request.model.clone(),
            status: log_status,
            credential_id,
            processing_time_ms: elapsed_ms,
            request_size: request_size as i64,
            response_size,
            error,
        });

        match &outcome {
            Ok(url) => tracing::info!(
                "请求完成: request_id={}, model={}, elapsed={}ms, url={}",
                request_id,
                request.model,
                elapsed_ms,
                url
            ),
            Err(e) => tracing::warn!(
                "请求失败: request_id={}, model={}, elapsed={}ms, error={}",
                request_id,
                request.model,
                elapsed_ms,
                e
            ),
        }

        outcome
    }

    /// 主流程。凭据由 RAII 守卫持有，任何 `?` 提前返回都会释放
    async fn execute(
        &self,
        request: &ChatRequest,
        request_id: &str,
        credential_id: &mut Option<u64>,
        task_id: &mut Option<String>,
        tx: &mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<String, GatewayError> {
        // 1. 准入：容量耗尽直接失败，不创建任务记录
        let guard = self
            .dispatcher
            .acquire_any_guarded()
            .ok_or(GatewayError::NoCapacity)?;
        let credential = guard.credential().clone();
        *credential_id = Some(credential.id);

        // 2. 解析请求与模型。客户端错误在这里返回，守卫随之释放，
        //    不会发起任何上游调用
        let parsed = request.parse_prompt().map_err(GatewayError::Client)?;
        let spec = catalog::resolve(&request.model)
            .ok_or_else(|| GatewayError::Client(format!("未知模型: {}", request.model)))?;

        // 3. 创建任务记录（PENDING → PROCESSING），发出首个进度帧
        let id = Uuid::new_v4().to_string();
        let task = TaskRecord {
            id: id.clone(),
            modality: spec.modality.kind().to_string(),
            status: TaskStatus::Pending,
            request_id: request_id.to_string(),
            model: request.model.clone(),
            prompt: parsed.prompt.clone(),
            source_media: parsed.seed_media.as_ref().map(|s| s.url.clone()),
            result_url: None,
            error: None,
            credential_id: credential.id,
            created_at: Utc::now(),
            completed_at: None,
            processing_time_ms: None,
        };
        self.store
            .create_task(&task)
            .await
            .map_err(|e| GatewayError::Internal(format!("任务创建失败: {}", e)))?;
        self.store
            .update_task_status(
                &id,
                TaskUpdate {
                    status: TaskStatus::Processing,
                    result_url: None,
                    error: None,
                    completed_at: None,
                    processing_time_ms: None,
                },
            )
            .await
            .map_err(|e| GatewayError::Internal(format!("任务状态更新失败: {}", e)))?;
        *task_id = Some(id);

        let _ = tx
            .send(ChatCompletionChunk::progress(
                request_id,
                &request.model,
                format!("> 任务已创建，开始生成: {}\n", truncate_with_ellipsis(&parsed.prompt, 80)),
            ))
            .await;

        // 4. 解析种子素材（经缓存），按（形态, 是否有种子）选择上游操作
        let seed = match &parsed.seed_media {
            Some(seed) => Some(self.resolve_seed_media(seed).await?),
            None => None,
        };

        if matches!(spec.modality, Modality::Video { .. }) {
            let _ = tx
                .send(ChatCompletionChunk::progress(
                    request_id,
                    &request.model,
                    "> 视频生成中，可能需要数分钟\n",
                ))
                .await;
        }

        let result_url = match (spec.modality, seed) {
            (Modality::Image { width, height }, None) => {
                self.upstream
                    .generate_image(&parsed.prompt, &credential, width, height)
                    .await?
            }
            (Modality::Image { width, height }, Some(seed)) => {
                self.upstream
                    .generate_image_from_image(&parsed.prompt, seed, &credential, width, height)
                    .await?
            }
            (
                Modality::Video {
                    orientation,
                    duration_frames,
                },
                None,
            ) => {
                self.upstream
                    .generate_video(&parsed.prompt, &credential, orientation, duration_frames)
                    .await?
            }
            (
                Modality::Video {
                    orientation,
                    duration_frames,
                },
                Some(seed),
            ) => {
                self.upstream
                    .generate_video_from_image(
                        &parsed.prompt,
                        seed,
                        &credential,
                        orientation,
                        duration_frames,
                    )
                    .await?
            }
        };

        Ok(result_url)
        // guard 在此处（或任何提前返回处）Drop，凭据恰好释放一次
    }

    /// 获取种子素材字节：先查缓存，未命中则下载并写入缓存。
    /// 缓存读失败只降级为重新下载，绝不使请求失败
    async fn resolve_seed_media(&self, seed: &SeedMedia) -> Result<Bytes, GatewayError> {
        if let Some(path) = self.cache.get(&seed.url) {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    tracing::debug!("种子素材缓存命中: url={}", seed.url);
                    return Ok(Bytes::from(bytes));
                }
                Err(e) => {
                    tracing::warn!("缓存文件读取失败，回退下载: url={}, error={}", seed.url, e);
                }
            }
        }

        let bytes = self.upstream.fetch_media(&seed.url).await?;
        self.cache.set(&seed.url, &seed.url, &bytes);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::catalog::Orientation;
    use crate::error::UpstreamError;
    use crate::store::{
        GatewayStats, LogListResponse, LogQuery, TaskListResponse, TaskQuery,
    };
    use crate::token::{AdmissionController, Credential, CredentialPool};

    /// 确定性的上游替身
    struct MockUpstream {
        result: Mutex<Result<String, UpstreamError>>,
        generate_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
    }

    impl MockUpstream {
        fn ok(url: &str) -> Self {
            Self {
                result: Mutex::new(Ok(url.to_string())),
                generate_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
            }
        }

        fn failing(error: UpstreamError) -> Self {
            Self {
                result: Mutex::new(Err(error)),
                generate_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
            }
        }

        fn take_result(&self) -> Result<String, UpstreamError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            self.result.lock().clone()
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn generate_image(
            &self,
            _prompt: &str,
            _credential: &Credential,
            _width: u32,
            _height: u32,
        ) -> Result<String, UpstreamError> {
            self.take_result()
        }

        async fn generate_image_from_image(
            &self,
            _prompt: &str,
            _seed: Bytes,
            _credential: &Credential,
            _width: u32,
            _height: u32,
        ) -> Result<String, UpstreamError> {
            self.take_result()
        }

        async fn generate_video(
            &self,
            _prompt: &str,
            _credential: &Credential,
            _orientation: Orientation,
            _duration_frames: u32,
        ) -> Result<String, UpstreamError> {
            self.take_result()
        }

        async fn generate_video_from_image(
            &self,
            _prompt: &str,
            _seed: Bytes,
            _credential: &Credential,
            _orientation: Orientation,
            _duration_frames: u32,
        ) -> Result<String, UpstreamError> {
            self.take_result()
        }

        async fn bind_character(
            &self,
            _name: &str,
            _seed: Bytes,
            _credential: &Credential,
        ) -> Result<String, UpstreamError> {
            Ok("character-1".to_string())
        }

        async fn remix(
            &self,
            _prompt: &str,
            _artifact_url: &str,
            _credential: &Credential,
        ) -> Result<String, UpstreamError> {
            self.take_result()
        }

        async fn fetch_media(&self, _url: &str) -> Result<Bytes, UpstreamError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"seed-bytes"))
        }
    }

    /// 内存版持久化替身
    #[derive(Default)]
    struct MemoryStore {
        tasks: Mutex<Vec<TaskRecord>>,
        logs: Mutex<Vec<RequestLog>>,
    }

    #[async_trait]
    impl TaskStore for MemoryStore {
        async fn create_task(&self, task: &TaskRecord) -> anyhow::Result<()> {
            self.tasks.lock().push(task.clone());
            Ok(())
        }

        async fn update_task_status(
            &self,
            task_id: &str,
            update: TaskUpdate,
        ) -> anyhow::Result<()> {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks
                .iter_mut()
                .find(|t| t.id == task_id && !t.status.is_terminal())
            {
                task.status = update.status;
                if update.result_url.is_some() {
                    task.result_url = update.result_url;
                }
                if update.error.is_some() {
                    task.error = update.error;
                }
                if update.completed_at.is_some() {
                    task.completed_at = update.completed_at;
                }
                if update.processing_time_ms.is_some() {
                    task.processing_time_ms = update.processing_time_ms;
                }
            }
            Ok(())
        }

        fn append_log(&self, log: RequestLog) {
            self.logs.lock().push(log);
        }

        async fn list_tasks(&self, _query: TaskQuery) -> anyhow::Result<TaskListResponse> {
            let tasks = self.tasks.lock().clone();
            Ok(TaskListResponse {
                total: tasks.len() as u64,
                page: 1,
                page_size: 50,
                tasks,
            })
        }

        async fn list_logs(&self, _query: LogQuery) -> anyhow::Result<LogListResponse> {
            let logs = self.logs.lock().clone();
            Ok(LogListResponse {
                total: logs.len() as u64,
                page: 1,
                page_size: 50,
                logs,
            })
        }

        async fn aggregate_stats(&self) -> anyhow::Result<GatewayStats> {
            let logs = self.logs.lock();
            Ok(GatewayStats {
                total_requests: logs.len() as u64,
                error_count: logs.iter().filter(|l| l.status != "completed").count() as u64,
                error_rate: 0.0,
                avg_processing_ms: 0.0,
                models: Vec::new(),
            })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        dispatcher: Arc<Dispatcher>,
        upstream: Arc<MockUpstream>,
        store: Arc<MemoryStore>,
        orchestrator: RequestOrchestrator,
    }

    fn harness(credentials: usize, budget: u32, upstream: MockUpstream) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            Arc::new(CredentialPool::load_all(dir.path().join("credentials.json")).unwrap());
        for i in 0..credentials {
            pool.add(format!("cred-{}", i), format!("secret-{}", i))
                .unwrap();
        }
        let admission = Arc::new(AdmissionController::initialize(
            &pool.credential_ids(),
            budget,
        ));
        let dispatcher = Arc::new(Dispatcher::new(pool, admission));
        let upstream = Arc::new(upstream);
        let store = Arc::new(MemoryStore::default());
        let cache = Arc::new(
            ArtifactCache::new(true, dir.path().join("cache"), Duration::from_secs(60)).unwrap(),
        );
        let orchestrator = RequestOrchestrator::new(
            dispatcher.clone(),
            upstream.clone(),
            cache,
            store.clone(),
        );
        Harness {
            _dir: dir,
            dispatcher,
            upstream,
            store,
            orchestrator,
        }
    }

    fn text_request(model: &str, prompt: &str) -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}]
        }))
        .unwrap()
    }

    fn seeded_request(model: &str, prompt: &str, image_url: &str) -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": image_url}}
            ]}]
        }))
        .unwrap()
    }

    async fn run_and_collect(
        harness: &Harness,
        request: ChatRequest,
    ) -> Vec<ChatCompletionChunk> {
        let (tx, mut rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let _ = harness.orchestrator.run(request, 128, tx).await;
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// 测试成功路径：恰好释放一次凭据、恰好一条日志、任务到 COMPLETED、
    /// 终止帧最后发出且携带产物 URL
    #[tokio::test]
    async fn test_successful_run() {
        let h = harness(1, 1, MockUpstream::ok("https://cdn.example.com/out.png"));
        let frames = run_and_collect(&h, text_request("pix-image", "一只猫")).await;

        assert!(frames.len() >= 2, "应有进度帧与终止帧");
        let last = frames.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.content(), "https://cdn.example.com/out.png");
        for frame in &frames[..frames.len() - 1] {
            assert!(!frame.is_terminal(), "终止帧必须是最后一帧");
        }

        let tasks = h.store.tasks.lock();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(
            tasks[0].result_url.as_deref(),
            Some("https://cdn.example.com/out.png")
        );
        assert!(tasks[0].processing_time_ms.is_some());
        drop(tasks);

        let logs = h.store.logs.lock();
        assert_eq!(logs.len(), 1, "恰好一条请求日志");
        assert_eq!(logs[0].status, "completed");
        assert!(logs[0].credential_id.is_some());
        drop(logs);

        // 凭据已释放：budget=1 仍可再次获取
        assert!(h.dispatcher.acquire_any().is_some());
    }

    /// 测试上游失败：任务 FAILED、凭据仍释放、仍只有一条日志、
    /// 终止错误帧与成功帧同构
    #[tokio::test]
    async fn test_upstream_failure() {
        let h = harness(1, 1, MockUpstream::failing(UpstreamError::RateLimited));
        let frames = run_and_collect(&h, text_request("pix-image", "一只猫")).await;

        let last = frames.last().unwrap();
        assert!(last.is_terminal());
        assert!(!last.content().is_empty());

        let tasks = h.store.tasks.lock();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.is_some());
        drop(tasks);

        let logs = h.store.logs.lock();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "upstream_error");
        drop(logs);

        assert!(h.dispatcher.acquire_any().is_some(), "失败后凭据必须已释放");
    }

    /// 测试容量耗尽：不创建任务、写一条 no_capacity 日志、发一个终止错误帧
    #[tokio::test]
    async fn test_no_capacity() {
        let h = harness(1, 1, MockUpstream::ok("https://cdn.example.com/out.png"));
        // 手动占满唯一名额
        let occupied = h.dispatcher.acquire_any().unwrap();

        let frames = run_and_collect(&h, text_request("pix-image", "一只猫")).await;
        assert_eq!(frames.len(), 1, "容量耗尽只发终止帧");
        assert!(frames[0].is_terminal());

        assert!(h.store.tasks.lock().is_empty(), "容量拒绝先于任务创建");
        let logs = h.store.logs.lock();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "no_capacity");
        assert!(logs[0].credential_id.is_none());
        drop(logs);

        assert_eq!(h.upstream.generate_calls.load(Ordering::SeqCst), 0);
        h.dispatcher.release(occupied.id);
    }

    /// 测试未知模型：凭据立即释放、无上游调用、无任务记录、日志为 client_error
    #[tokio::test]
    async fn test_unknown_model() {
        let h = harness(1, 1, MockUpstream::ok("https://cdn.example.com/out.png"));
        let frames = run_and_collect(&h, text_request("gpt-4o", "一只猫")).await;

        assert!(frames.last().unwrap().is_terminal());
        assert!(h.store.tasks.lock().is_empty());
        let logs = h.store.logs.lock();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "client_error");
        drop(logs);

        assert_eq!(h.upstream.generate_calls.load(Ordering::SeqCst), 0);
        assert!(h.dispatcher.acquire_any().is_some(), "客户端错误后凭据必须已释放");
    }

    /// 测试种子素材经缓存：同一来源第二次请求不再下载
    #[tokio::test]
    async fn test_seed_media_cached() {
        let h = harness(1, 1, MockUpstream::ok("https://cdn.example.com/out.mp4"));
        let url = "https://img.example.com/seed.png";

        run_and_collect(&h, seeded_request("pix-video", "让画面动起来", url)).await;
        run_and_collect(&h, seeded_request("pix-video", "再来一次", url)).await;

        assert_eq!(
            h.upstream.fetch_calls.load(Ordering::SeqCst),
            1,
            "第二次请求应命中缓存"
        );
        assert_eq!(h.upstream.generate_calls.load(Ordering::SeqCst), 2);

        // 两个任务都记录了种子来源
        let tasks = h.store.tasks.lock();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.source_media.as_deref() == Some(url)));
        assert!(tasks.iter().all(|t| t.modality == "video"));
    }

    /// 测试并发场景：3 凭据额度各 1，3 个并发请求全部获准且用满容量，
    /// 第 4 个请求得到 no_capacity；一个完成释放后新请求可获准
    #[tokio::test]
    async fn test_concurrent_admission_scenario() {
        let h = harness(3, 1, MockUpstream::ok("https://cdn.example.com/out.png"));

        // 先占满 3 个凭据，模拟 3 个在途请求
        let g1 = h.dispatcher.acquire_any().unwrap();
        let g2 = h.dispatcher.acquire_any().unwrap();
        let g3 = h.dispatcher.acquire_any().unwrap();
        let mut ids = vec![g1.id, g2.id, g3.id];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        // 第 4 个请求：no_capacity
        let frames = run_and_collect(&h, text_request("pix-image", "第四个")).await;
        assert_eq!(h.store.logs.lock().last().unwrap().status, "no_capacity");
        assert!(frames[0].is_terminal());

        // 任一在途请求完成释放后，新请求应完整走通
        h.dispatcher.release(g2.id);
        let frames = run_and_collect(&h, text_request("pix-image", "第五个")).await;
        assert_eq!(
            frames.last().unwrap().content(),
            "https://cdn.example.com/out.png"
        );
        assert_eq!(h.store.logs.lock().last().unwrap().status, "completed");

        h.dispatcher.release(g1.id);
        h.dispatcher.release(g3.id);
    }
}

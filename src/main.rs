//! pixgate-rs —— OpenAI 兼容的图像/视频生成网关
//!
//! 接收 chat-completion 风格请求，轮询上游凭据池（每凭据限并发）
//! 调用慢速生成 API，以 SSE 进度帧回传结果。

mod cache;
mod catalog;
mod common;
mod config;
mod error;
mod openai;
mod orchestrator;
mod store;
mod token;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::openai::handler::{AppState, router};
use crate::orchestrator::RequestOrchestrator;
use crate::store::SqliteTaskStore;
use crate::token::{AdmissionController, CredentialPool, Dispatcher};
use crate::upstream::{HttpUpstreamClient, ProxyPool};

#[derive(Parser, Debug)]
#[command(name = "pixgate-rs", about = "OpenAI 兼容的图像/视频生成网关")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value_t = Config::default_config_path().to_string())]
    config: String,

    /// 监听地址（覆盖配置文件）
    #[arg(long)]
    host: Option<String>,

    /// 监听端口（覆盖配置文件）
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    // === 组件构造：显式传值，无全局单例 ===
    let pool = Arc::new(CredentialPool::load_all(&config.credentials_path)?);
    if pool.enabled_count() == 0 {
        tracing::warn!("当前没有启用的凭据，所有生成请求将返回容量耗尽");
    }
    let admission = Arc::new(AdmissionController::initialize(
        &pool.credential_ids(),
        config.concurrency_budget,
    ));
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), admission.clone()));

    let proxies = Arc::new(
        ProxyPool::new(&config.proxy_urls, config.upstream_timeout_secs)
            .context("构建出站代理池失败")?,
    );
    if proxies.len() > 1 {
        tracing::info!("出站代理池已启用: proxies={}", proxies.len());
    }
    let upstream = Arc::new(HttpUpstreamClient::new(
        config.upstream_base_url.clone(),
        proxies,
    ));

    let cache = Arc::new(ArtifactCache::new(
        config.cache.enabled,
        config.cache.dir.clone(),
        Duration::from_secs(config.cache.ttl_secs),
    )?);
    let _sweeper = cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));

    let db_path = config
        .db_path
        .to_str()
        .context("数据库路径包含非法字符")?
        .to_string();
    let store = Arc::new(SqliteTaskStore::new(&db_path)?);

    let orchestrator = Arc::new(RequestOrchestrator::new(
        dispatcher,
        upstream,
        cache.clone(),
        store.clone(),
    ));

    let state = AppState {
        api_key: config.api_key.clone(),
        orchestrator,
        store,
        cache,
        pool,
        admission,
        concurrency_budget: config.concurrency_budget,
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听地址绑定失败: {}", addr))?;
    tracing::info!("pixgate-rs 已启动: http://{}", addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

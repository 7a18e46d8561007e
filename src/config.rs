//! 应用配置
//!
//! JSON 配置文件，字段缺省时使用默认值。所有组件在构造时显式接收配置值，
//! 不使用全局单例。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// 是否启用素材缓存
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// 缓存目录
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// 缓存条目 TTL（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// 过期清理间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_cache_ttl_secs() -> u64 {
    60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Pixgate 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 网关 API 密钥
    #[serde(default)]
    pub api_key: Option<String>,

    /// 上游生成 API 地址
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,

    /// 上游请求超时（秒）。生成任务可能耗时数分钟，默认放宽
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// 凭据文件路径
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,

    /// 每个凭据的并发额度
    #[serde(default = "default_concurrency_budget")]
    pub concurrency_budget: u32,

    /// 出站代理地址列表（可选，轮询使用）
    /// 支持格式: http://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_urls: Vec<String>,

    /// SQLite 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// 缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_base_url() -> String {
    "https://api.pixgen.example.com".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    600
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_concurrency_budget() -> u32 {
    3
}

fn default_db_path() -> PathBuf {
    PathBuf::from("pixgate.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
            upstream_base_url: default_upstream_base_url(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            credentials_path: default_credentials_path(),
            concurrency_budget: default_concurrency_budget(),
            proxy_urls: Vec::new(),
            db_path: default_db_path(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }
}

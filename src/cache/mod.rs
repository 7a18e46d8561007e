//! 素材缓存
//!
//! 逻辑键到磁盘文件的 TTL 缓存。读路径与定期清理共用同一把索引锁和
//! 同一个删除过程，保证并发下对同一条目的淘汰收敛为一次一致的删除。
//! 缓存读写失败一律降级为未命中，绝不使所在请求失败。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// 缓存条目
#[derive(Debug, Clone)]
struct CacheEntry {
    artifact_location: PathBuf,
    source_url: String,
    created_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
}

/// 缓存统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub entry_count: usize,
    pub ttl_secs: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

/// 磁盘素材缓存
pub struct ArtifactCache {
    enabled: bool,
    dir: PathBuf,
    state: Mutex<CacheState>,
}

impl ArtifactCache {
    /// 创建缓存；启用时确保缓存目录存在
    pub fn new(enabled: bool, dir: impl Into<PathBuf>, ttl: Duration) -> anyhow::Result<Self> {
        let dir = dir.into();
        if enabled {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            enabled,
            dir,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                ttl,
            }),
        })
    }

    /// 运行时更新 TTL
    pub fn set_ttl(&self, ttl: Duration) {
        self.state.lock().ttl = ttl;
        tracing::info!("缓存 TTL 已更新: {}s", ttl.as_secs());
    }

    /// 查询缓存
    ///
    /// 条目存在、未过期且磁盘文件仍在时返回存储路径并更新访问统计；
    /// 过期或文件缺失的条目走统一删除过程后返回未命中
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }

        let mut state = self.state.lock();
        let ttl = state.ttl;
        let entry = state.entries.get(key)?;

        if entry.created_at.elapsed() > ttl {
            tracing::debug!("缓存条目已过期: key={}", key);
            Self::remove_entry_locked(&mut state.entries, key);
            return None;
        }
        if !entry.artifact_location.exists() {
            tracing::warn!("缓存文件已丢失: key={}", key);
            Self::remove_entry_locked(&mut state.entries, key);
            return None;
        }

        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed_at = Instant::now();
        Some(entry.artifact_location.clone())
    }

    /// 写入缓存
    ///
    /// 字节落盘到缓存目录（文件名由键的 sha256 派生，避免冲突），
    /// 注册条目并返回存储路径。缓存禁用或落盘失败时返回 None
    pub fn set(&self, key: &str, source_url: &str, bytes: &[u8]) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }

        let path = self.dir.join(Self::artifact_filename(key, source_url));
        if let Err(e) = std::fs::write(&path, bytes) {
            tracing::warn!("缓存写入失败，降级为未缓存: key={}, error={}", key, e);
            return None;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                artifact_location: path.clone(),
                source_url: source_url.to_string(),
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
            },
        );
        tracing::debug!("缓存已写入: key={}, size={}", key, bytes.len());
        Some(path)
    }

    /// 清理所有过期条目
    ///
    /// 与 get 的内联淘汰共用同一把锁与同一个删除过程；
    /// 返回本次清理删除的条目数
    pub fn sweep(&self) -> usize {
        if !self.enabled {
            return 0;
        }

        let mut state = self.state.lock();
        let ttl = state.ttl;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            Self::remove_entry_locked(&mut state.entries, key);
        }
        if !expired.is_empty() {
            tracing::info!("缓存清理完成: removed={}", expired.len());
        }
        expired.len()
    }

    /// 缓存统计
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            enabled: self.enabled,
            entry_count: state.entries.len(),
            ttl_secs: state.ttl.as_secs(),
        }
    }

    /// 启动后台定期清理任务
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一跳立即触发，跳过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }

    /// 统一的条目删除过程：先删磁盘文件再移除索引。
    /// 文件删除失败只记录日志，索引仍然移除
    fn remove_entry_locked(entries: &mut HashMap<String, CacheEntry>, key: &str) {
        if let Some(entry) = entries.remove(key) {
            tracing::debug!(
                "移除缓存条目: key={}, source={}, accesses={}, idle={}s",
                key,
                entry.source_url,
                entry.access_count,
                entry.last_accessed_at.elapsed().as_secs()
            );
            if let Err(e) = std::fs::remove_file(&entry.artifact_location) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "缓存文件删除失败: path={}, error={}",
                        entry.artifact_location.display(),
                        e
                    );
                }
            }
        }
    }

    /// 由键派生抗冲突文件名，保留来源 URL 的扩展名便于排查
    fn artifact_filename(key: &str, source_url: &str) -> String {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        match extension_of(source_url) {
            Some(ext) => format!("{}.{}", digest, ext),
            None => digest,
        }
    }
}

/// 从 URL 提取简短的文件扩展名
fn extension_of(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let ext = Path::new(path).extension()?.to_str()?;
    if ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(ext)
    } else {
        None
    }
}

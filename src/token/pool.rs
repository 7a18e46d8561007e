//! 上游凭据池
//!
//! 持有全部已知凭据，按轮询顺序选出下一个启用的凭据。凭据持久化在
//! JSON 文件中，管理操作（增删改）会写回文件；热路径只做轮询游标推进。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 上游凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: u64,
    pub label: String,
    pub secret: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// 凭据更新补丁，None 字段保持不变
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPatch {
    pub label: Option<String>,
    pub secret: Option<String>,
    pub enabled: Option<bool>,
}

/// 凭据文件格式
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    credentials: Vec<Credential>,
}

/// 池内部状态，整体由一把锁保护
struct PoolState {
    credentials: Vec<Credential>,
    /// 轮询游标。启用集合每次调用都重新计算，游标只对当时的集合取模——
    /// 并发启停凭据时选择可能跳过或重复某个条目，这是已知并接受的行为，
    /// 不保证稳定的轮询排列
    cursor: usize,
    next_id: u64,
}

/// 凭据池
pub struct CredentialPool {
    path: PathBuf,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// 从凭据文件加载全部凭据；文件不存在时创建空池
    pub fn load_all<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let credentials = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("读取凭据文件失败: {}", path.display()))?;
            let file: CredentialsFile = serde_json::from_str(&content)
                .with_context(|| format!("解析凭据文件失败: {}", path.display()))?;
            file.credentials
        } else {
            tracing::warn!("凭据文件不存在，使用空凭据池: {}", path.display());
            Vec::new()
        };

        let next_id = credentials.iter().map(|c| c.id + 1).max().unwrap_or(1);
        tracing::info!(
            "凭据池已加载: total={}, enabled={}",
            credentials.len(),
            credentials.iter().filter(|c| c.enabled).count()
        );

        Ok(Self {
            path,
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
                next_id,
            }),
        })
    }

    /// 添加凭据，返回分配的 ID
    pub fn add(&self, label: impl Into<String>, secret: impl Into<String>) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let id = state.next_id;
        state.next_id += 1;
        state.credentials.push(Credential {
            id,
            label: label.into(),
            secret: secret.into(),
            enabled: true,
            created_at: now,
            updated_at: now,
        });
        self.save_locked(&state)?;
        Ok(id)
    }

    /// 更新凭据
    pub fn update(&self, id: u64, patch: CredentialPatch) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let cred = state
            .credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("凭据不存在: {}", id))?;

        if let Some(label) = patch.label {
            cred.label = label;
        }
        if let Some(secret) = patch.secret {
            cred.secret = secret;
        }
        if let Some(enabled) = patch.enabled {
            cred.enabled = enabled;
        }
        cred.updated_at = Utc::now();
        self.save_locked(&state)
    }

    /// 删除凭据
    pub fn remove(&self, id: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let before = state.credentials.len();
        state.credentials.retain(|c| c.id != id);
        if state.credentials.len() == before {
            anyhow::bail!("凭据不存在: {}", id);
        }
        self.save_locked(&state)
    }

    /// 轮询选出下一个启用的凭据；无启用凭据时返回 None
    pub fn next_enabled(&self) -> Option<Credential> {
        let mut state = self.state.lock();
        // 每次调用重新计算启用列表（启用状态可能在两次调用间变化）
        let enabled: Vec<usize> = state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled)
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            return None;
        }

        let pick = enabled[state.cursor % enabled.len()];
        state.cursor = state.cursor.wrapping_add(1);
        Some(state.credentials[pick].clone())
    }

    /// 当前启用的凭据数量
    pub fn enabled_count(&self) -> usize {
        self.state.lock().credentials.iter().filter(|c| c.enabled).count()
    }

    /// 全部凭据 ID（用于准入控制初始化）
    pub fn credential_ids(&self) -> Vec<u64> {
        self.state.lock().credentials.iter().map(|c| c.id).collect()
    }

    /// 全部凭据快照（管理接口用）
    pub fn list(&self) -> Vec<Credential> {
        self.state.lock().credentials.clone()
    }

    fn save_locked(&self, state: &PoolState) -> anyhow::Result<()> {
        let file = CredentialsFile {
            credentials: state.credentials.clone(),
        };
        let content = serde_json::to_string_pretty(&file).context("序列化凭据文件失败")?;
        fs::write(&self.path, content)
            .with_context(|| format!("写入凭据文件失败: {}", self.path.display()))?;
        Ok(())
    }
}

//! 凭据调度
//!
//! 组合凭据池与准入控制：最多走完一整圈轮询，返回第一个获准的凭据；
//! 整圈无果则返回无容量信号（可重试的背压，不是错误）。

use std::sync::Arc;

use super::admission::AdmissionController;
use super::pool::{Credential, CredentialPool};

/// 凭据调度器
pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    admission: Arc<AdmissionController>,
}

impl Dispatcher {
    pub fn new(pool: Arc<CredentialPool>, admission: Arc<AdmissionController>) -> Self {
        Self { pool, admission }
    }

    /// 获取任意一个有空余名额的启用凭据
    ///
    /// 返回的凭据已在准入控制器中登记为在用；返回 None 表示所有启用凭据
    /// 均已达并发上限（或无启用凭据）
    pub fn acquire_any(&self) -> Option<Credential> {
        // 最多尝试一整圈，不重复消耗轮询位置
        let cycle = self.pool.enabled_count();
        for _ in 0..cycle {
            let Some(cred) = self.pool.next_enabled() else {
                break;
            };
            if self.admission.acquire(cred.id) {
                tracing::debug!("凭据已准入: id={}, label={}", cred.id, cred.label);
                return Some(cred);
            }
        }
        tracing::debug!("所有启用凭据并发额度已用尽");
        None
    }

    /// 释放一个准入名额
    pub fn release(&self, credential_id: u64) {
        self.admission.release(credential_id);
    }

    /// 以 RAII 守卫形式获取凭据，守卫销毁时保证恰好释放一次
    pub fn acquire_any_guarded(self: &Arc<Self>) -> Option<AdmissionGuard> {
        let credential = self.acquire_any()?;
        Some(AdmissionGuard {
            dispatcher: self.clone(),
            credential,
            released: false,
        })
    }
}

/// 准入守卫
///
/// 持有期间占用一个并发名额；任何退出路径（正常返回、错误、panic）
/// 都会在 Drop 中释放，且只释放一次
pub struct AdmissionGuard {
    dispatcher: Arc<Dispatcher>,
    credential: Credential,
    released: bool,
}

impl AdmissionGuard {
    /// 获准的凭据
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// 提前释放（幂等）
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.dispatcher.release(self.credential.id);
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

//! 并发准入控制
//!
//! 按凭据跟踪在途请求数与并发额度。`acquire` 在单把锁内完成
//! 检查加自增，额度耗尽后并发的两次 acquire 绝不会同时成功。

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

/// 单个凭据的准入状态
#[derive(Debug, Clone, Copy)]
struct Slot {
    in_use: u32,
    budget: u32,
}

/// 准入状态快照（只读，观测用）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionSnapshot {
    pub entries: Vec<AdmissionEntry>,
}

/// 快照中的单条记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionEntry {
    pub credential_id: u64,
    pub in_use: u32,
    pub budget: u32,
}

/// 并发准入控制器
///
/// 不变量：任意时刻 0 <= in_use <= budget
pub struct AdmissionController {
    slots: Mutex<HashMap<u64, Slot>>,
}

impl AdmissionController {
    /// 按凭据 ID 列表初始化，所有凭据使用统一的默认额度
    pub fn initialize(credential_ids: &[u64], default_budget: u32) -> Self {
        let budget = default_budget.max(1);
        let slots = credential_ids
            .iter()
            .map(|&id| (id, Slot { in_use: 0, budget }))
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// 跟踪新凭据（凭据池新增后调用）
    pub fn track(&self, credential_id: u64, budget: u32) {
        let mut slots = self.slots.lock();
        slots.entry(credential_id).or_insert(Slot {
            in_use: 0,
            budget: budget.max(1),
        });
    }

    /// 停止跟踪凭据（凭据删除后调用）
    pub fn untrack(&self, credential_id: u64) {
        self.slots.lock().remove(&credential_id);
    }

    /// 该凭据当前是否可准入
    pub fn can_admit(&self, credential_id: u64) -> bool {
        self.slots
            .lock()
            .get(&credential_id)
            .map(|s| s.in_use < s.budget)
            .unwrap_or(false)
    }

    /// 原子的检查加自增：in_use < budget 时自增并返回 true，否则不动并返回 false
    pub fn acquire(&self, credential_id: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&credential_id) {
            Some(slot) if slot.in_use < slot.budget => {
                slot.in_use += 1;
                true
            }
            _ => false,
        }
    }

    /// 释放一个准入名额
    ///
    /// in_use 已经为 0 时说明释放次数多于获取次数，属于逻辑错误，
    /// 记录 error 日志并拒绝递减
    pub fn release(&self, credential_id: u64) {
        let mut slots = self.slots.lock();
        match slots.get_mut(&credential_id) {
            Some(slot) if slot.in_use > 0 => {
                slot.in_use -= 1;
            }
            Some(_) => {
                tracing::error!("准入释放次数超过获取次数: credential_id={}", credential_id);
            }
            None => {
                tracing::error!("释放未跟踪的凭据: credential_id={}", credential_id);
            }
        }
    }

    /// 统一设置所有已跟踪凭据的额度
    pub fn set_budget(&self, budget: u32) {
        let budget = budget.max(1);
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            slot.budget = budget;
        }
        tracing::info!("并发额度已更新: budget={}", budget);
    }

    /// 仍有空余名额的凭据数量
    pub fn available_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.in_use < s.budget)
            .count()
    }

    /// 只读快照
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let slots = self.slots.lock();
        let mut entries: Vec<AdmissionEntry> = slots
            .iter()
            .map(|(&id, s)| AdmissionEntry {
                credential_id: id,
                in_use: s.in_use,
                budget: s.budget,
            })
            .collect();
        entries.sort_by_key(|e| e.credential_id);
        AdmissionSnapshot { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// 测试额度 B：恰好 B 次 acquire 成功，之后 can_admit 为 false；
    /// 一次 release 后重新可准入
    #[test]
    fn test_budget_exhaustion_and_release() {
        let ctrl = AdmissionController::initialize(&[1], 2);

        assert!(ctrl.acquire(1));
        assert!(ctrl.acquire(1));
        assert!(!ctrl.can_admit(1));
        assert!(!ctrl.acquire(1));

        ctrl.release(1);
        assert!(ctrl.can_admit(1));
        assert!(ctrl.acquire(1));
    }

    /// 测试未跟踪凭据不可准入
    #[test]
    fn test_unknown_credential() {
        let ctrl = AdmissionController::initialize(&[1], 1);
        assert!(!ctrl.can_admit(99));
        assert!(!ctrl.acquire(99));
    }

    /// 测试多释放不会把计数减到负数
    #[test]
    fn test_release_floor_at_zero() {
        let ctrl = AdmissionController::initialize(&[1], 1);
        ctrl.release(1);
        ctrl.release(1);

        // 计数仍为 0，额度完整可用
        assert!(ctrl.acquire(1));
        assert!(!ctrl.acquire(1));
    }

    /// 测试统一设置额度
    #[test]
    fn test_set_budget() {
        let ctrl = AdmissionController::initialize(&[1, 2], 1);
        assert!(ctrl.acquire(1));
        assert!(!ctrl.can_admit(1));

        ctrl.set_budget(3);
        assert!(ctrl.can_admit(1));
        assert!(ctrl.acquire(1));
        assert!(ctrl.acquire(1));
        assert!(!ctrl.acquire(1));
    }

    /// 测试 available_count 与快照
    #[test]
    fn test_available_count_and_snapshot() {
        let ctrl = AdmissionController::initialize(&[1, 2, 3], 1);
        assert_eq!(ctrl.available_count(), 3);

        assert!(ctrl.acquire(2));
        assert_eq!(ctrl.available_count(), 2);

        let snapshot = ctrl.snapshot();
        assert_eq!(snapshot.entries.len(), 3);
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.credential_id == 2)
            .unwrap();
        assert_eq!(entry.in_use, 1);
        assert_eq!(entry.budget, 1);
    }

    /// 测试并发 acquire 不会超出额度
    #[test]
    fn test_concurrent_acquire_never_exceeds_budget() {
        let ctrl = Arc::new(AdmissionController::initialize(&[1], 4));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ctrl = ctrl.clone();
            handles.push(std::thread::spawn(move || {
                if ctrl.acquire(1) { 1u32 } else { 0 }
            }));
        }

        let admitted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 4);
        assert!(!ctrl.can_admit(1));
    }
}

//! 乐观更新对账 - 业务能力层
//!
//! ## 流程
//!
//! 1. 用户发起转换时，立即把本地批次状态改成预期值，并记录 [`PendingExpectation`]
//! 2. 之后每次刷新，如果该批次有待确认的期望：
//!    - 服务端状态 == 预期 → 清除期望，采用服务端数据
//!    - 不一致 → 保留本地乐观值，跳过这次服务端数据，下次再比
//! 3. 期望存活超过 TTL 后无条件清除，之后一律采用服务端数据
//!
//! 第 3 步保证乐观值永远不会无限期地掩盖服务端的真实状态。

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::{Batch, BatchId, BatchStatus};

/// 一条待确认的乐观期望
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExpectation {
    pub batch_id: BatchId,
    pub expected_status: BatchStatus,
    /// 本次乐观修改前的本地状态，请求失败时用于回滚
    pub previous_status: BatchStatus,
    pub created_at: Instant,
    /// 被本次期望覆盖的上一条期望，回滚时恢复
    pub superseded: Option<Box<PendingExpectation>>,
}

impl PendingExpectation {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// 单个批次的对账结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 没有待确认期望，直接采用服务端数据
    Adopted,
    /// 服务端确认了预期状态
    Confirmed,
    /// 服务端尚未确认，保留本地乐观值
    Held,
    /// 期望超时，采用服务端数据
    Expired,
}

impl ReconcileOutcome {
    pub fn adopts_server(self) -> bool {
        !matches!(self, ReconcileOutcome::Held)
    }
}

/// 对账器（每个观察者会话一个）
#[derive(Debug)]
pub struct Reconciler {
    pending: HashMap<BatchId, PendingExpectation>,
    ttl: Duration,
}

impl Reconciler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 乐观修改本地批次并记录期望
    pub fn apply_optimistic(&mut self, batch: &mut Batch, expected: BatchStatus) {
        self.apply_optimistic_at(batch, expected, Instant::now());
    }

    pub fn apply_optimistic_at(&mut self, batch: &mut Batch, expected: BatchStatus, now: Instant) {
        debug!(
            "乐观更新批次 {}: {} → {}",
            batch.id, batch.status, expected
        );
        let superseded = self.pending.remove(&batch.id).map(Box::new);
        self.pending.insert(
            batch.id.clone(),
            PendingExpectation {
                batch_id: batch.id.clone(),
                expected_status: expected,
                previous_status: batch.status,
                created_at: now,
                superseded,
            },
        );
        batch.status = expected;
    }

    /// 请求失败：只撤销最近一次乐观修改，之前仍待确认的期望保持不变
    pub fn rollback(&mut self, batch: &mut Batch) -> bool {
        let Some(expectation) = self.pending.remove(&batch.id) else {
            return false;
        };
        info!(
            "↩️ 回滚批次 {} 的乐观更新: {} → {}",
            batch.id, batch.status, expectation.previous_status
        );
        batch.status = expectation.previous_status;
        if let Some(earlier) = expectation.superseded {
            self.pending.insert(batch.id.clone(), *earlier);
        }
        true
    }

    /// 丢弃期望（不修改本地数据）
    pub fn discard(&mut self, batch_id: &BatchId) -> Option<PendingExpectation> {
        self.pending.remove(batch_id)
    }

    pub fn pending(&self, batch_id: &BatchId) -> Option<&PendingExpectation> {
        self.pending.get(batch_id)
    }

    pub fn has_pending(&self, batch_id: &BatchId) -> bool {
        self.pending.contains_key(batch_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 与一条服务端数据对账
    pub fn reconcile(&mut self, server: &Batch) -> ReconcileOutcome {
        self.reconcile_at(server, Instant::now())
    }

    pub fn reconcile_at(&mut self, server: &Batch, now: Instant) -> ReconcileOutcome {
        let Some(expectation) = self.pending.get(&server.id) else {
            return ReconcileOutcome::Adopted;
        };

        if expectation.age(now) >= self.ttl {
            warn!(
                "⏱️ 批次 {} 的乐观状态 {} 超时未确认，采用服务端状态 {}",
                server.id, expectation.expected_status, server.status
            );
            self.pending.remove(&server.id);
            return ReconcileOutcome::Expired;
        }

        if server.status == expectation.expected_status {
            debug!("✓ 服务端确认批次 {} 状态 {}", server.id, server.status);
            self.pending.remove(&server.id);
            return ReconcileOutcome::Confirmed;
        }

        debug!(
            "批次 {} 服务端状态 {} 尚未到达预期 {}，保留本地值",
            server.id, server.status, expectation.expected_status
        );
        ReconcileOutcome::Held
    }

    /// 用一次完整刷新的结果更新本地批次表
    ///
    /// 服务端不再返回的批次会被移除，同时丢弃其期望
    pub fn reconcile_all(
        &mut self,
        local: &mut HashMap<BatchId, Batch>,
        server: Vec<Batch>,
    ) -> HashMap<BatchId, ReconcileOutcome> {
        self.reconcile_all_at(local, server, Instant::now())
    }

    pub fn reconcile_all_at(
        &mut self,
        local: &mut HashMap<BatchId, Batch>,
        server: Vec<Batch>,
        now: Instant,
    ) -> HashMap<BatchId, ReconcileOutcome> {
        let mut outcomes = HashMap::with_capacity(server.len());
        let mut seen = HashSet::with_capacity(server.len());

        for batch in server {
            seen.insert(batch.id.clone());
            let mut outcome = self.reconcile_at(&batch, now);
            if outcome == ReconcileOutcome::Held && !local.contains_key(&batch.id) {
                // 本地没有可保留的值
                outcome = ReconcileOutcome::Adopted;
            }
            if outcome.adopts_server() {
                local.insert(batch.id.clone(), batch.clone());
            }
            outcomes.insert(batch.id, outcome);
        }

        local.retain(|id, _| seen.contains(id));
        self.pending.retain(|id, _| seen.contains(id));

        outcomes
    }
}

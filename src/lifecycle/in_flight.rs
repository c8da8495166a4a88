//! 每个批次同一时刻只允许一个状态变更请求在处理中
//!
//! 只读轮询不受限制，可以和写请求并发。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{AppError, AppResult};
use crate::models::batch::BatchId;

/// 处理中的批次集合
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    inner: Arc<Mutex<HashSet<BatchId>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 占用批次；已被占用时返回 `StateConflict::InFlight`
    pub fn acquire(&self, batch_id: &BatchId) -> AppResult<InFlightGuard> {
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(batch_id.clone()) {
            return Err(AppError::in_flight(batch_id.as_str()));
        }
        Ok(InFlightGuard {
            set: self.inner.clone(),
            batch_id: batch_id.clone(),
        })
    }

    pub fn contains(&self, batch_id: &BatchId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(batch_id)
    }
}

/// 占用凭证，drop 时释放
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<Mutex<HashSet<BatchId>>>,
    batch_id: BatchId,
}

impl InFlightGuard {
    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.batch_id);
    }
}

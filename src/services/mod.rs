//! 业务能力层（Services Layer）
//!
//! ## 模块划分
//!
//! - `api`：与批次服务交互的窄接口 [`BatchApi`]
//! - `task_tracker`：长耗时任务的轮询会话
//! - `reconciler`：乐观更新与权威数据的对账
//! - `aggregation`：单批次指标与多批次汇总
//! - `memory_backend`：内存版权威服务端
//!
//! 本层不持有任何观察者状态，由 workflow 层组合使用。

pub mod aggregation;
pub mod api;
pub mod memory_backend;
pub mod reconciler;
pub mod task_tracker;

pub use api::BatchApi;
pub use memory_backend::{ArchivedBatch, BackendFaults, MemoryBackend};
pub use reconciler::{PendingExpectation, ReconcileOutcome, Reconciler};
pub use task_tracker::{PollingSession, TaskEvent, TaskTracker, TaskUpdate, TrackKey};

//! # Batch Monitor
//!
//! 文档分析批次的生命周期监控：状态机、任务轮询、乐观更新对账和仪表盘汇总
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Models / Lifecycle / Clients）
//! - `models/` - 批次、任务、仪表盘的数据模型与 TOML 加载
//! - `lifecycle/` - 批次状态机和每批次单写者约束
//! - `clients/` - `BatchApi` 的 HTTP 实现
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `TaskTracker` - 长耗时任务的轮询
//! - `Reconciler` - 乐观更新与权威数据对账
//! - `aggregation` - 批次指标与多批次汇总
//! - `MemoryBackend` - 进程内的权威服务端
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个观察者"的完整交互流程
//! - `ViewerSession` - 刷新、用户动作、任务事件、销毁
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/app` - 应用入口，组装服务端和观察者
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use clients::HttpBatchClient;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use lifecycle::LifecycleAction;
pub use models::{Batch, BatchId, BatchStatus, DashboardSnapshot, SelectionContext, TaskKind};
pub use orchestrator::App;
pub use services::{BatchApi, MemoryBackend, Reconciler, TaskTracker};
pub use workflow::{Confirmation, ViewerSession, ViewerSettings};

//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责组装和调度，是整个系统的"指挥中心"。
//!
//! ### `app` - 应用
//! - 管理应用生命周期（初始化、运行、清理）
//! - 选择服务端实现（HTTP / 进程内）
//! - 批量提交批次配置（并发受限）
//! - 定期输出仪表盘
//!
//! ## 层次关系
//!
//! ```text
//! app (组装与调度)
//!     ↓
//! workflow::ViewerSession (单个观察者)
//!     ↓
//! services (能力层：tracker / reconciler / aggregation)
//!     ↓
//! lifecycle (状态机) + clients (HTTP)
//! ```
//!
//! ## 设计原则
//!
//! 1. **向下依赖**：编排层 → workflow → services → lifecycle / models
//! 2. **无业务逻辑**：只做调度和输出，不做状态判断

pub mod app;

pub use app::App;

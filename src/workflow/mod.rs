//! 流程层（Workflow Layer）
//!
//! ## 职责
//!
//! 把 services 层的能力组合成一个观察者的完整交互流程：
//! 预检 → 乐观更新 → 请求 → 任务轮询 → 对账 → 通知。
//!
//! 每个 [`ViewerSession`] 相互独立，不共享可变状态。

pub mod viewer;

pub use viewer::{
    Confirmation, Notice, NoticeLevel, RefreshReport, TaskView, ViewerSession, ViewerSettings,
};

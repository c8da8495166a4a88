//! 批次状态机
//!
//! ```text
//! SAVED → READY_FOR_STAGING → STAGING → STAGED → ANALYZING → COMPLETED
//!   └──────────────────────────↗  │                 ⇅  │         │
//!                    FAILED_STAGING ←┘            PAUSED  └→ FAILED
//! ```
//!
//! 所有转换只由服务端发出；客户端只在乐观更新时借用同一张邻接表做预检。
//! 不在邻接表里的 (状态, 动作) 组合一律返回 `StateConflict`，从不静默成功。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppResult, StateConflict};
use crate::models::batch::BatchId;
use crate::models::status::BatchStatus;
use crate::models::task::TaskKind;

/// 生命周期动作
///
/// 前七个是用户动作，其余是只有服务端才会触发的系统事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleAction {
    Stage,
    RunAnalysis,
    Pause,
    Resume,
    Rerun,
    RestageAndRerun,
    ResetToPrestage,
    // ---- 系统事件 ----
    MarkReady,
    StagingSucceeded,
    StagingFailed,
    AnalysisCompleted,
    AnalysisFailed,
}

impl LifecycleAction {
    pub const USER_ACTIONS: [LifecycleAction; 7] = [
        LifecycleAction::Stage,
        LifecycleAction::RunAnalysis,
        LifecycleAction::Pause,
        LifecycleAction::Resume,
        LifecycleAction::Rerun,
        LifecycleAction::RestageAndRerun,
        LifecycleAction::ResetToPrestage,
    ];

    pub const ALL: [LifecycleAction; 12] = [
        LifecycleAction::Stage,
        LifecycleAction::RunAnalysis,
        LifecycleAction::Pause,
        LifecycleAction::Resume,
        LifecycleAction::Rerun,
        LifecycleAction::RestageAndRerun,
        LifecycleAction::ResetToPrestage,
        LifecycleAction::MarkReady,
        LifecycleAction::StagingSucceeded,
        LifecycleAction::StagingFailed,
        LifecycleAction::AnalysisCompleted,
        LifecycleAction::AnalysisFailed,
    ];

    /// 线上路径片段
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleAction::Stage => "stage",
            LifecycleAction::RunAnalysis => "run-analysis",
            LifecycleAction::Pause => "pause",
            LifecycleAction::Resume => "resume",
            LifecycleAction::Rerun => "rerun",
            LifecycleAction::RestageAndRerun => "restage-and-rerun",
            LifecycleAction::ResetToPrestage => "reset-to-prestage",
            LifecycleAction::MarkReady => "mark-ready",
            LifecycleAction::StagingSucceeded => "staging-succeeded",
            LifecycleAction::StagingFailed => "staging-failed",
            LifecycleAction::AnalysisCompleted => "analysis-completed",
            LifecycleAction::AnalysisFailed => "analysis-failed",
        }
    }

    pub fn is_user_action(self) -> bool {
        Self::USER_ACTIONS.contains(&self)
    }

    /// 需要用户明确确认的破坏性动作
    pub fn is_destructive(self) -> bool {
        matches!(self, LifecycleAction::ResetToPrestage)
    }

    /// 该动作启动的后台任务类型；`None` 表示同步返回状态
    pub fn task_kind(self) -> Option<TaskKind> {
        match self {
            LifecycleAction::Stage | LifecycleAction::RestageAndRerun => Some(TaskKind::Stage),
            LifecycleAction::RunAnalysis | LifecycleAction::Rerun => Some(TaskKind::RunAnalysis),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 转换附带的副作用，由服务端执行
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionEffects {
    /// 清空所有响应（重置为等待）
    pub clear_responses: bool,
    /// 重新校验文档
    pub revalidate_documents: bool,
    /// 取消文档分配
    pub unassign_documents: bool,
    /// 清空进度与耗时
    pub clear_progress: bool,
}

/// 一次合法转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BatchStatus,
    pub to: BatchStatus,
    pub action: LifecycleAction,
    pub effects: TransitionEffects,
}

/// 邻接表：返回目标状态，非法组合返回 `None`
pub fn next_status(status: BatchStatus, action: LifecycleAction) -> Option<BatchStatus> {
    use BatchStatus::*;
    use LifecycleAction::*;

    match (action, status) {
        (MarkReady, Saved) => Some(ReadyForStaging),
        (Stage, Saved | ReadyForStaging | FailedStaging) => Some(Staging),
        (StagingSucceeded, Staging) => Some(Staged),
        (StagingFailed, Staging) => Some(FailedStaging),
        (RunAnalysis, Staged) => Some(Analyzing),
        (Pause, Analyzing) => Some(Paused),
        (Resume, Paused) => Some(Analyzing),
        (AnalysisCompleted, Analyzing) => Some(Completed),
        (AnalysisFailed, Analyzing) => Some(Failed),
        (Rerun, Completed) => Some(Analyzing),
        (RestageAndRerun, Completed) => Some(Staging),
        (ResetToPrestage, Analyzing | Staging | FailedStaging | Paused) => Some(Saved),
        _ => None,
    }
}

fn effects_of(action: LifecycleAction) -> TransitionEffects {
    match action {
        LifecycleAction::Rerun => TransitionEffects {
            clear_responses: true,
            ..Default::default()
        },
        LifecycleAction::RestageAndRerun => TransitionEffects {
            clear_responses: true,
            revalidate_documents: true,
            ..Default::default()
        },
        LifecycleAction::ResetToPrestage => TransitionEffects {
            clear_responses: true,
            unassign_documents: true,
            clear_progress: true,
            ..Default::default()
        },
        _ => TransitionEffects::default(),
    }
}

pub fn is_valid(status: BatchStatus, action: LifecycleAction) -> bool {
    next_status(status, action).is_some()
}

/// 校验并生成转换；非法组合返回 `StateConflict::InvalidTransition`
pub fn transition(
    batch_id: &BatchId,
    status: BatchStatus,
    action: LifecycleAction,
) -> AppResult<Transition> {
    let to = next_status(status, action).ok_or_else(|| StateConflict::InvalidTransition {
        batch_id: batch_id.to_string(),
        status,
        action,
    })?;

    Ok(Transition {
        from: status,
        to,
        action,
        effects: effects_of(action),
    })
}

/// 当前状态下可用的用户动作，用于禁用对应的控件
pub fn available_actions(status: BatchStatus) -> Vec<LifecycleAction> {
    LifecycleAction::USER_ACTIONS
        .iter()
        .copied()
        .filter(|action| is_valid(status, *action))
        .collect()
}

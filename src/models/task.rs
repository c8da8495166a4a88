//! 异步任务句柄与任务状态
//!
//! 服务端的长耗时操作（暂存、分析、重置数据库、快照、恢复）都以任务句柄的形式返回。
//! 传输层可能返回空字符串、`null` 或字面量 `"null"` 作为任务 ID，这些值一律在
//! 反序列化时归一化为 `None`，之后的代码只和 `Option<TaskId>` 打交道。

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::models::status::BatchStatus;

/// 任务 ID（保证非空、不是 "null"）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// 归一化原始任务 ID
    ///
    /// 空白、空字符串以及 `"null"` / `"undefined"`（大小写不敏感）都视为"没有任务"
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("null")
            || trimmed.eq_ignore_ascii_case("undefined")
        {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_task_id(deserializer)?
            .ok_or_else(|| serde::de::Error::custom("任务 ID 为空或为 \"null\""))
    }
}

/// 把字符串 / 整数 / null 统一反序列化为 `Option<TaskId>`
pub fn deserialize_task_id<'de, D>(deserializer: D) -> Result<Option<TaskId>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct TaskIdVisitor;

    impl<'de> Visitor<'de> for TaskIdVisitor {
        type Value = Option<TaskId>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a task id string, integer or null")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(TaskId::parse(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(TaskId::parse(&value.to_string()))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(TaskId::parse(&value.to_string()))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(TaskIdVisitor)
        }
    }

    deserializer.deserialize_any(TaskIdVisitor)
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Stage,
    RunAnalysis,
    ResetDatabase,
    CreateSnapshot,
    RestoreSnapshot,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Stage => "stage",
            TaskKind::RunAnalysis => "run-analysis",
            TaskKind::ResetDatabase => "reset-database",
            TaskKind::CreateSnapshot => "create-snapshot",
            TaskKind::RestoreSnapshot => "restore-snapshot",
        }
    }

    /// 是否属于维护类任务（不绑定具体批次）
    pub fn is_maintenance(self) -> bool {
        matches!(
            self,
            TaskKind::ResetDatabase | TaskKind::CreateSnapshot | TaskKind::RestoreSnapshot
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    #[serde(alias = "failed")]
    Error,
}

impl TaskState {
    /// 收到终态后必须在同一轮停止轮询
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Error)
    }
}

/// 单次轮询得到的任务状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub status: TaskState,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub current_step: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn new(status: TaskState, progress_percent: u8) -> Self {
        Self {
            status,
            progress_percent: progress_percent.min(100),
            current_step: None,
            total_steps: None,
            error: None,
        }
    }

    pub fn with_steps(mut self, current: u32, total: u32) -> Self {
        self.current_step = Some(current);
        self.total_steps = Some(total);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// 进度提示文本，例如 `步骤 2/5 (40%)`
    pub fn progress_label(&self) -> String {
        match (self.current_step, self.total_steps) {
            (Some(current), Some(total)) => {
                format!("步骤 {}/{} ({}%)", current, total, self.progress_percent)
            }
            _ => format!("{}%", self.progress_percent),
        }
    }
}

/// 任务句柄
///
/// `task_id == None` 表示操作并没有真正启动，调用方绝不能开始轮询。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub kind: TaskKind,
    #[serde(default, deserialize_with = "deserialize_task_id")]
    pub task_id: Option<TaskId>,
}

impl TaskHandle {
    pub fn new(kind: TaskKind, task_id: Option<TaskId>) -> Self {
        Self { kind, task_id }
    }

    pub fn is_started(&self) -> bool {
        self.task_id.is_some()
    }
}

/// 生命周期动作的返回：同步状态、任务句柄，或仅表示已受理
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Status(BatchStatus),
    Task(TaskHandle),
    Accepted,
}

/// 生命周期动作接口的原始响应体
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    #[serde(default)]
    pub status: Option<BatchStatus>,
    #[serde(default, deserialize_with = "deserialize_task_id")]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ActionResponse {
    /// 根据动作预期的任务类型归一化响应
    ///
    /// 预期返回任务的动作如果拿不到有效 ID，返回一个未启动的句柄而不是同步状态。
    pub fn into_outcome(self, expected_task: Option<TaskKind>) -> ActionOutcome {
        match (self.task_id, expected_task, self.status) {
            (task_id, Some(kind), _) => ActionOutcome::Task(TaskHandle::new(kind, task_id)),
            (_, None, Some(status)) => ActionOutcome::Status(status),
            (_, None, None) => ActionOutcome::Accepted,
        }
    }
}

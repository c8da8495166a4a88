use thiserror::Error;

use crate::lifecycle::LifecycleAction;
use crate::models::status::BatchStatus;
use crate::models::task::TaskKind;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 任务 ID 未知或已被回收，停止轮询
    #[error("任务句柄无效: {task_id}")]
    InvalidTask { task_id: String },
    /// 操作返回的任务 ID 为空 / "null"，操作并未真正启动
    #[error("没有有效的任务: {kind} 操作未启动")]
    NoTask { kind: TaskKind },
    /// 状态冲突
    #[error("状态冲突: {0}")]
    StateConflict(#[from] StateConflict),
    /// 超时 / 连接失败，下一轮重试
    #[error("网络暂时不可用 ({endpoint}): {message}")]
    TransientNetwork { endpoint: String, message: String },
    /// 请求参数校验失败，未发出任何请求
    #[error("参数校验失败: {0}")]
    Validation(#[from] ValidationError),
    /// 批次不存在
    #[error("批次不存在: {batch_id}")]
    NotFound { batch_id: String },
    /// API 调用错误
    #[error("API错误: {0}")]
    Api(#[from] ApiError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

/// 状态冲突
#[derive(Debug, Error)]
pub enum StateConflict {
    /// 当前状态不允许该动作
    #[error("批次 {batch_id} 当前状态 {status} 不允许执行 {action}")]
    InvalidTransition {
        batch_id: String,
        status: BatchStatus,
        action: LifecycleAction,
    },
    /// 同一批次已有状态变更请求在处理中
    #[error("批次 {batch_id} 已有状态变更请求在处理中")]
    InFlight { batch_id: String },
    /// 服务端拒绝（HTTP 409）
    #[error("服务端拒绝了批次 {batch_id} 的状态变更: {message}")]
    Rejected { batch_id: String, message: String },
}

/// 请求参数错误
#[derive(Debug, Error)]
pub enum ValidationError {
    /// 元数据无法解析
    #[error("元数据格式错误: {reason}")]
    MalformedMetadata { reason: String },
    /// 元数据键不合法
    #[error("元数据键不合法: {key}")]
    InvalidMetadataKey { key: String },
    /// 批次名称为空
    #[error("批次名称不能为空")]
    EmptyName,
    /// 没有文档
    #[error("批次至少需要一个文档")]
    NoDocuments,
    /// 破坏性操作未确认
    #[error("操作 {action} 需要用户明确确认")]
    ConfirmationRequired { action: String },
    /// 查询参数不合法
    #[error("查询参数不合法: {reason}")]
    InvalidQuery { reason: String },
    /// 服务端返回的校验错误（HTTP 400 / 422）
    #[error("服务端校验失败: {message}")]
    Rejected { message: String },
}

/// API 调用错误
#[derive(Debug, Error)]
pub enum ApiError {
    /// 网络请求失败（非瞬时错误）
    #[error("API请求失败 ({endpoint}): {source}")]
    RequestFailed {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    /// API 返回错误响应
    #[error("API返回错误响应 ({endpoint}): status={status}, message={message:?}")]
    BadResponse {
        endpoint: String,
        status: u16,
        message: Option<String>,
    },
    /// JSON 解析失败
    #[error("JSON解析失败: {source}")]
    JsonParseFailed {
        #[source]
        source: serde_json::Error,
    },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 目录不存在
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: String },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    InvalidValue { field: String, reason: String },
}

// ========== 从常见错误类型转换 ==========

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        let endpoint = err.url().map(|u| u.to_string()).unwrap_or_default();
        if err.is_timeout() || err.is_connect() {
            AppError::TransientNetwork {
                endpoint,
                message: err.to_string(),
            }
        } else if err.is_decode() {
            AppError::Api(ApiError::BadResponse {
                endpoint,
                status: err.status().map(|s| s.as_u16()).unwrap_or_default(),
                message: Some(err.to_string()),
            })
        } else {
            AppError::Api(ApiError::RequestFailed {
                endpoint,
                source: err,
            })
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Api(ApiError::JsonParseFailed { source: err })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::File(FileError::TomlParseFailed {
            path: String::new(), // TOML 错误本身不携带路径
            source: err,
        })
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: err,
        })
    }
}

// ========== 便捷构造与分类 ==========

impl AppError {
    pub fn invalid_task(task_id: impl Into<String>) -> Self {
        AppError::InvalidTask {
            task_id: task_id.into(),
        }
    }

    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::TransientNetwork {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn not_found(batch_id: impl Into<String>) -> Self {
        AppError::NotFound {
            batch_id: batch_id.into(),
        }
    }

    pub fn in_flight(batch_id: impl Into<String>) -> Self {
        AppError::StateConflict(StateConflict::InFlight {
            batch_id: batch_id.into(),
        })
    }

    /// 瞬时错误：轮询循环吞掉并在下一轮重试
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientNetwork { .. })
    }

    pub fn is_invalid_task(&self) -> bool {
        matches!(self, AppError::InvalidTask { .. })
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, AppError::StateConflict(_))
    }

    /// 面向用户的提示文本
    pub fn user_message(&self) -> String {
        match self {
            AppError::InvalidTask { task_id } => {
                format!("处理已停止：任务句柄无效 ({})", task_id)
            }
            AppError::NoTask { kind } => {
                format!("{} 未启动：没有有效的任务", kind)
            }
            AppError::TransientNetwork { .. } => "网络暂时不可用，稍后自动重试".to_string(),
            AppError::Api(ApiError::BadResponse {
                message: Some(detail),
                ..
            }) => format!("服务端错误: {}", detail),
            other => other.to_string(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

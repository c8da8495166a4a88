//! 批次服务 HTTP 客户端
//!
//! 封装所有与批次服务 REST 接口相关的调用逻辑，并把 HTTP 状态码映射为领域错误：
//!
//! | 状态码 | 错误 |
//! |---|---|
//! | 404（任务接口） | `InvalidTask` |
//! | 404（批次接口） | `NotFound` |
//! | 409 | `StateConflict::Rejected` |
//! | 400 / 422 | `ValidationError::Rejected` |
//! | 5xx | `TransientNetwork` |

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::config::Config;
use crate::error::{ApiError, AppError, AppResult, StateConflict, ValidationError};
use crate::lifecycle::LifecycleAction;
use crate::models::{
    ActionOutcome, ActionResponse, Batch, BatchConfig, BatchFilter, BatchId, DashboardSnapshot,
    Page, Response, ResponseQuery, SelectionContext, TaskHandle, TaskId, TaskKind, TaskStatus,
};
use crate::services::api::BatchApi;
use crate::utils::logging::truncate_text;

/// 请求针对的资源，决定 404 / 409 的含义
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Task(TaskId),
    Batch(BatchId),
    Collection,
}

/// 批次服务客户端
pub struct HttpBatchClient {
    base_url: String,
    client: Client,
}

impl HttpBatchClient {
    /// 创建新的客户端
    pub fn new(config: &Config) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 发送请求并解析 JSON 响应体
    ///
    /// # 参数
    /// - `request`: 构造好的请求
    /// - `endpoint`: 用于日志与错误信息的路径
    /// - `scope`: 请求针对的资源
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        endpoint: &str,
        scope: Scope,
    ) -> AppResult<T> {
        let response = self.send_raw(request, endpoint, scope).await?;
        let body = response.text().await?;
        debug!("{} 响应: {}", endpoint, truncate_text(&body, 200));
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_raw(
        &self,
        request: RequestBuilder,
        endpoint: &str,
        scope: Scope,
    ) -> AppResult<reqwest::Response> {
        debug!("➡️ {}", endpoint);
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(
            status.as_u16(),
            endpoint,
            &scope,
            error_message(&body),
        ))
    }
}

/// 从错误响应体中提取说明文字
fn error_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    if let Ok(JsonValue::Object(object)) = serde_json::from_str::<JsonValue>(body) {
        for field in ["message", "error", "detail"] {
            if let Some(text) = object.get(field).and_then(JsonValue::as_str) {
                return Some(text.to_string());
            }
        }
    }
    Some(truncate_text(body.trim(), 200))
}

/// HTTP 状态码 → 领域错误
fn map_status(status: u16, endpoint: &str, scope: &Scope, message: Option<String>) -> AppError {
    match (status, scope) {
        (404, Scope::Task(task_id)) => AppError::invalid_task(task_id.as_str()),
        (404, Scope::Batch(batch_id)) => AppError::not_found(batch_id.as_str()),
        (409, scope) => {
            let batch_id = match scope {
                Scope::Batch(id) => id.to_string(),
                _ => String::new(),
            };
            StateConflict::Rejected {
                batch_id,
                message: message.unwrap_or_else(|| "状态冲突".to_string()),
            }
            .into()
        }
        (400 | 422, _) => ValidationError::Rejected {
            message: message.unwrap_or_else(|| format!("HTTP {}", status)),
        }
        .into(),
        (500..=599, _) => AppError::transient(
            endpoint,
            message.unwrap_or_else(|| format!("HTTP {}", status)),
        ),
        _ => ApiError::BadResponse {
            endpoint: endpoint.to_string(),
            status,
            message,
        }
        .into(),
    }
}

/// 仪表盘查询参数：逗号分隔的批次 ID，未选择时省略
fn selection_query(selection: &SelectionContext) -> Vec<(&'static str, String)> {
    if selection.is_empty() {
        return Vec::new();
    }
    let ids: Vec<&str> = selection.ids().map(BatchId::as_str).collect();
    vec![("batch_ids", ids.join(","))]
}

#[async_trait]
impl BatchApi for HttpBatchClient {
    async fn list_batches(&self, filter: &BatchFilter) -> AppResult<Vec<Batch>> {
        let endpoint = "/api/batches";
        let request = self.client.get(self.url(endpoint)).query(filter);
        self.send(request, endpoint, Scope::Collection).await
    }

    async fn get_batch(&self, id: &BatchId) -> AppResult<Batch> {
        let endpoint = format!("/api/batches/{}", id);
        let request = self.client.get(self.url(&endpoint));
        self.send(request, &endpoint, Scope::Batch(id.clone())).await
    }

    async fn create_batch(&self, config: &BatchConfig) -> AppResult<Batch> {
        // 元数据不合法时不发请求
        config.validate()?;
        let endpoint = "/api/batches";
        let request = self.client.post(self.url(endpoint)).json(config);
        self.send(request, endpoint, Scope::Collection).await
    }

    async fn delete_batch(&self, id: &BatchId, reason: &str) -> AppResult<()> {
        let endpoint = format!("/api/batches/{}", id);
        let request = self
            .client
            .delete(self.url(&endpoint))
            .json(&json!({ "reason": reason }));
        self.send_raw(request, &endpoint, Scope::Batch(id.clone()))
            .await?;
        Ok(())
    }

    async fn perform(&self, id: &BatchId, action: LifecycleAction) -> AppResult<ActionOutcome> {
        let endpoint = format!("/api/batches/{}/{}", id, action);
        let request = self.client.post(self.url(&endpoint));
        let response: ActionResponse = self
            .send(request, &endpoint, Scope::Batch(id.clone()))
            .await?;
        Ok(response.into_outcome(action.task_kind()))
    }

    async fn start_task(&self, kind: TaskKind, params: JsonValue) -> AppResult<TaskHandle> {
        let endpoint = format!("/api/tasks/{}", kind);
        let request = self.client.post(self.url(&endpoint)).json(&params);
        let response: ActionResponse = self.send(request, &endpoint, Scope::Collection).await?;
        Ok(TaskHandle::new(kind, response.task_id))
    }

    async fn get_task_status(&self, task_id: &TaskId) -> AppResult<TaskStatus> {
        let endpoint = format!("/api/tasks/{}", task_id);
        let request = self.client.get(self.url(&endpoint));
        self.send(request, &endpoint, Scope::Task(task_id.clone()))
            .await
    }

    async fn list_responses(
        &self,
        id: &BatchId,
        query: &ResponseQuery,
    ) -> AppResult<Page<Response>> {
        let endpoint = format!("/api/batches/{}/responses", id);
        let request = self.client.get(self.url(&endpoint)).query(query);
        self.send(request, &endpoint, Scope::Batch(id.clone())).await
    }

    async fn get_dashboard(&self, selection: &SelectionContext) -> AppResult<DashboardSnapshot> {
        let endpoint = "/api/dashboard";
        let request = self
            .client
            .get(self.url(endpoint))
            .query(&selection_query(selection));
        self.send(request, endpoint, Scope::Collection).await
    }
}

//! 批次、文档与响应数据结构

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{AppResult, ValidationError};
use crate::models::status::BatchStatus;

/// 批次 ID（不透明字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 文档计数
///
/// 不变量：`completed + failed + processing + waiting == total`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub processing: u64,
    pub waiting: u64,
}

impl DocumentCounts {
    /// 由各分项构造，`total` 自动求和
    pub fn new(completed: u64, failed: u64, processing: u64, waiting: u64) -> Self {
        Self {
            total: completed + failed + processing + waiting,
            completed,
            failed,
            processing,
            waiting,
        }
    }

    /// 分项之和溢出时视为不一致
    pub fn is_consistent(&self) -> bool {
        sum_parts([self.completed, self.failed, self.processing, self.waiting]) == Some(self.total)
    }

    /// 从文档列表汇总
    pub fn from_documents<'a>(documents: impl IntoIterator<Item = &'a Document>) -> Self {
        let mut counts = Self::default();
        for document in documents {
            match document.status() {
                DocumentStatus::Completed => counts.completed += 1,
                DocumentStatus::Failed => counts.failed += 1,
                DocumentStatus::Processing => counts.processing += 1,
                DocumentStatus::Waiting => counts.waiting += 1,
            }
            counts.total += 1;
        }
        counts
    }
}

/// 服务端给出的计数可能异常，求和溢出时返回 None
fn sum_parts(parts: [u64; 4]) -> Option<u64> {
    parts.into_iter().try_fold(0u64, u64::checked_add)
}

/// 响应计数
///
/// 不变量：`succeeded + failed + processing + waiting == total`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCounts {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub processing: u64,
    pub waiting: u64,
}

impl ResponseCounts {
    pub fn new(succeeded: u64, failed: u64, processing: u64, waiting: u64) -> Self {
        Self {
            total: succeeded + failed + processing + waiting,
            succeeded,
            failed,
            processing,
            waiting,
        }
    }

    pub fn is_consistent(&self) -> bool {
        sum_parts([self.succeeded, self.failed, self.processing, self.waiting]) == Some(self.total)
    }

    /// 已结束（成功或失败）的响应数
    pub fn finished(&self) -> u64 {
        self.succeeded.saturating_add(self.failed)
    }

    /// 批次的响应计数是其所有文档响应的多重集并集
    pub fn from_responses<'a>(responses: impl IntoIterator<Item = &'a Response>) -> Self {
        let mut counts = Self::default();
        for response in responses {
            counts.add(response.status);
        }
        counts
    }

    fn add(&mut self, status: ResponseStatus) {
        match status {
            ResponseStatus::Succeeded => self.succeeded += 1,
            ResponseStatus::Failed => self.failed += 1,
            ResponseStatus::Processing => self.processing += 1,
            ResponseStatus::Waiting => self.waiting += 1,
        }
        self.total += 1;
    }
}

/// 批次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub document_counts: DocumentCounts,
    #[serde(default)]
    pub response_counts: ResponseCounts,
    /// 累计处理时长（秒）
    #[serde(default)]
    pub elapsed_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(id: impl Into<BatchId>, name: impl Into<String>, status: BatchStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
            document_counts: DocumentCounts::default(),
            response_counts: ResponseCounts::default(),
            elapsed_seconds: 0,
            estimated_completion: None,
        }
    }

    pub fn with_documents(mut self, counts: DocumentCounts) -> Self {
        self.document_counts = counts;
        self
    }

    pub fn with_responses(mut self, counts: ResponseCounts) -> Self {
        self.response_counts = counts;
        self
    }

    pub fn with_elapsed(mut self, seconds: u64) -> Self {
        self.elapsed_seconds = seconds;
        self
    }

    /// 检查两组计数的不变量
    pub fn counts_consistent(&self) -> bool {
        self.document_counts.is_consistent() && self.response_counts.is_consistent()
    }
}

impl From<String> for BatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 文档完成状态（由其响应推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
}

/// 批次内的单个文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub batch_id: BatchId,
    pub filename: String,
    #[serde(default)]
    pub responses: Vec<Response>,
}

impl Document {
    /// 推导文档状态
    ///
    /// - 没有响应或全部等待中 → Waiting
    /// - 有响应尚未结束 → Processing
    /// - 全部结束且至少一个成功 → Completed，否则 Failed
    pub fn status(&self) -> DocumentStatus {
        let counts = ResponseCounts::from_responses(&self.responses);
        if counts.total == 0 || counts.waiting == counts.total {
            DocumentStatus::Waiting
        } else if counts.finished() < counts.total {
            DocumentStatus::Processing
        } else if counts.succeeded > 0 {
            DocumentStatus::Completed
        } else {
            DocumentStatus::Failed
        }
    }
}

/// 响应状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Waiting,
    Processing,
    Succeeded,
    Failed,
}

impl ResponseStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, ResponseStatus::Succeeded | ResponseStatus::Failed)
    }
}

/// 单个（文档 × 提示词 × 连接）组合的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    pub document_id: String,
    pub prompt_id: String,
    pub connection_id: String,
    pub status: ResponseStatus,
    /// 适配度评分（0–100），与完成状态无关
    #[serde(default)]
    pub suitability_score: Option<u8>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_ms: Option<u64>,
}

impl Response {
    pub fn waiting(
        id: impl Into<String>,
        document_id: impl Into<String>,
        prompt_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            prompt_id: prompt_id.into(),
            connection_id: connection_id.into(),
            status: ResponseStatus::Waiting,
            suitability_score: None,
            started_at: None,
            completed_at: None,
            processing_ms: None,
        }
    }
}

/// 创建批次时提交的配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub name: String,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub prompt_ids: Vec<String>,
    #[serde(default)]
    pub connection_ids: Vec<String>,
    /// 发起方提供的元数据（JSON 对象字符串）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(skip_serializing, skip_deserializing)]
    pub file_path: Option<String>,
}

fn metadata_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,63}$").expect("metadata key pattern is valid")
    })
}

impl BatchConfig {
    /// 在发出任何网络请求之前校验配置，并解析元数据
    pub fn validate(&self) -> AppResult<BTreeMap<String, JsonValue>> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if self.documents.is_empty() {
            return Err(ValidationError::NoDocuments.into());
        }
        self.parse_metadata()
    }

    /// 解析元数据字符串，必须是 JSON 对象
    pub fn parse_metadata(&self) -> AppResult<BTreeMap<String, JsonValue>> {
        let Some(raw) = self.metadata.as_deref() else {
            return Ok(BTreeMap::new());
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let parsed: JsonValue =
            serde_json::from_str(raw).map_err(|e| ValidationError::MalformedMetadata {
                reason: e.to_string(),
            })?;

        let object: Map<String, JsonValue> = match parsed {
            JsonValue::Object(object) => object,
            other => {
                return Err(ValidationError::MalformedMetadata {
                    reason: format!("元数据必须是 JSON 对象，实际为: {}", other),
                }
                .into())
            }
        };

        let pattern = metadata_key_pattern();
        let mut metadata = BTreeMap::new();
        for (key, value) in object {
            if !pattern.is_match(&key) {
                return Err(ValidationError::InvalidMetadataKey { key }.into());
            }
            metadata.insert(key, value);
        }
        Ok(metadata)
    }
}

/// 列表过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl BatchFilter {
    pub fn matches(&self, batch: &Batch) -> bool {
        if let Some(status) = self.status {
            if batch.status != status {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref() {
            let needle = search.to_lowercase();
            if !batch.name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// 响应分页查询
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseQuery {
    pub offset: usize,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<u8>,
}

impl Default for ResponseQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
            status: None,
            min_score: None,
        }
    }
}

impl ResponseQuery {
    pub fn matches(&self, response: &Response) -> bool {
        if let Some(status) = self.status {
            if response.status != status {
                return false;
            }
        }
        if let Some(min_score) = self.min_score {
            match response.suitability_score {
                Some(score) if score >= min_score => {}
                _ => return false,
            }
        }
        true
    }
}

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

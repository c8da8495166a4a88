//! 仪表盘输出契约
//!
//! 聚合模式标签本身就是输出的一部分：`active_only` 模式下的 `total_batches`
//! 实际含义是"活跃批次数"，调用方必须依据标签来解读它。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::batch::BatchId;
use crate::models::status::BatchStatus;

/// 观察者选中的批次集合（空集 = 未选择）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionContext(BTreeSet<BatchId>);

impl SelectionContext {
    pub fn new<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<BatchId>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// 从逗号分隔的 ID 列表解析，忽略空项
    pub fn parse_list(raw: &str) -> Self {
        Self::new(
            raw.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(BatchId::new),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, id: &BatchId) -> bool {
        self.0.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &BatchId> {
        self.0.iter()
    }
}

/// 聚合模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// 未选择且存在活跃批次：只统计活跃批次
    ActiveOnly,
    /// 未选择且没有活跃批次：统计全部批次
    AllBatches,
    /// 有选择：严格只统计选中的批次
    Filtered,
}

impl AggregationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationMode::ActiveOnly => "active_only",
            AggregationMode::AllBatches => "all_batches",
            AggregationMode::Filtered => "filtered",
        }
    }

    /// `total_batches` 在该模式下的展示标签
    pub fn total_label(self) -> &'static str {
        match self {
            AggregationMode::ActiveOnly => "活跃批次",
            AggregationMode::AllBatches => "全部批次",
            AggregationMode::Filtered => "选中批次",
        }
    }
}

/// 多批次汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub mode: AggregationMode,
    pub total_batches: usize,
    pub active_batches: usize,
    pub total_documents: u64,
    pub total_responses: u64,
    /// 由选中集合的成功/失败总数计算；分母为 0 时为 `None`（N/A）
    pub success_rate: Option<u8>,
    pub average_processing_secs: Option<f64>,
}

/// 单批次进度指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub id: BatchId,
    pub name: String,
    pub status: BatchStatus,
    pub progress_percent: u8,
    /// 每分钟完成的文档数
    pub throughput: f64,
    pub success_rate: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// 仪表盘快照：`{summaryStats, activeBatches[], recentBatches[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub summary_stats: SummaryStats,
    pub active_batches: Vec<BatchProgress>,
    pub recent_batches: Vec<BatchProgress>,
}

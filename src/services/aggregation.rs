//! 聚合引擎 - 业务能力层
//!
//! 单批次指标都是计数和时间戳的纯函数；多批次汇总先用 [`select_mode`] 决定模式，
//! 再只在该模式选出的集合上求和 / 求均值。
//!
//! 成功率必须由集合内成功、失败数的**总和**计算，不能对各批次成功率取平均
//! （平均会偏向小批次）。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::models::{
    AggregationMode, Batch, BatchProgress, DashboardSnapshot, ResponseCounts, SelectionContext,
    SummaryStats,
};

/// 四舍五入到整数百分比
fn percent(numerator: u64, denominator: u64) -> u8 {
    let value = (100.0 * numerator as f64 / denominator as f64).round();
    value.clamp(0.0, 100.0) as u8
}

/// 进度百分比 = (成功 + 失败) / 总数；总数为 0 时为 0
pub fn progress_percent(responses: &ResponseCounts) -> u8 {
    if responses.total == 0 {
        return 0;
    }
    percent(responses.finished(), responses.total)
}

/// 吞吐量：每分钟完成的文档数；耗时为 0 时为 0
pub fn throughput(completed_documents: u64, elapsed: Duration) -> f64 {
    let minutes = elapsed.as_secs_f64() / 60.0;
    if minutes <= 0.0 {
        return 0.0;
    }
    completed_documents as f64 / minutes
}

pub fn batch_throughput(batch: &Batch) -> f64 {
    throughput(
        batch.document_counts.completed,
        Duration::from_secs(batch.elapsed_seconds),
    )
}

/// 剩余时间 = (总数 - 已完成) / 吞吐量
///
/// 吞吐量为 0 或批次已处于终态时不给出估计
pub fn estimated_remaining(batch: &Batch) -> Option<Duration> {
    if batch.status.is_terminal() {
        return None;
    }
    let rate = batch_throughput(batch);
    if rate <= 0.0 {
        return None;
    }
    let remaining = batch
        .document_counts
        .total
        .saturating_sub(batch.document_counts.completed);
    Some(Duration::from_secs_f64(remaining as f64 / rate * 60.0))
}

pub fn estimated_completion(batch: &Batch, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let remaining = estimated_remaining(batch)?;
    let remaining = ChronoDuration::from_std(remaining).ok()?;
    now.checked_add_signed(remaining)
}

/// 成功率 = 成功 / (成功 + 失败)；分母为 0 时为 `None`（N/A）
pub fn success_rate(succeeded: u64, failed: u64) -> Option<u8> {
    let denominator = succeeded.saturating_add(failed);
    if denominator == 0 {
        return None;
    }
    Some(percent(succeeded, denominator))
}

pub fn batch_progress(batch: &Batch, now: DateTime<Utc>) -> BatchProgress {
    BatchProgress {
        id: batch.id.clone(),
        name: batch.name.clone(),
        status: batch.status,
        progress_percent: progress_percent(&batch.response_counts),
        throughput: batch_throughput(batch),
        success_rate: success_rate(batch.response_counts.succeeded, batch.response_counts.failed),
        estimated_completion: estimated_completion(batch, now),
    }
}

/// 选择聚合模式
///
/// - 选择非空 → `Filtered`
/// - 选择为空且存在活跃批次 → `ActiveOnly`
/// - 否则 → `AllBatches`
pub fn select_mode(batches: &[Batch], selection: &SelectionContext) -> AggregationMode {
    if !selection.is_empty() {
        AggregationMode::Filtered
    } else if batches.iter().any(|b| b.status.is_active()) {
        AggregationMode::ActiveOnly
    } else {
        AggregationMode::AllBatches
    }
}

/// 按模式选出参与汇总的批次
///
/// `Filtered` 模式下忽略未知的 ID，且不看批次是否活跃
pub fn select_batches<'a>(
    batches: &'a [Batch],
    selection: &SelectionContext,
) -> (AggregationMode, Vec<&'a Batch>) {
    let mode = select_mode(batches, selection);
    let selected = batches
        .iter()
        .filter(|batch| match mode {
            AggregationMode::Filtered => selection.contains(&batch.id),
            AggregationMode::ActiveOnly => batch.status.is_active(),
            AggregationMode::AllBatches => true,
        })
        .collect();
    (mode, selected)
}

/// 多批次汇总
pub fn summarize(batches: &[Batch], selection: &SelectionContext) -> SummaryStats {
    let (mode, selected) = select_batches(batches, selection);

    let mut total_documents = 0;
    let mut total_responses = 0;
    let mut succeeded = 0;
    let mut failed = 0;
    let mut processing_secs = Vec::new();

    for batch in &selected {
        total_documents = batch.document_counts.total.saturating_add(total_documents);
        total_responses = batch.response_counts.total.saturating_add(total_responses);
        succeeded = batch.response_counts.succeeded.saturating_add(succeeded);
        failed = batch.response_counts.failed.saturating_add(failed);
        if batch.elapsed_seconds > 0 {
            processing_secs.push(batch.elapsed_seconds as f64);
        }
    }

    let average_processing_secs = if processing_secs.is_empty() {
        None
    } else {
        Some(processing_secs.iter().sum::<f64>() / processing_secs.len() as f64)
    };

    SummaryStats {
        mode,
        total_batches: selected.len(),
        active_batches: selected.iter().filter(|b| b.status.is_active()).count(),
        total_documents,
        total_responses,
        success_rate: success_rate(succeeded, failed),
        average_processing_secs,
    }
}

/// 构建仪表盘快照
///
/// `active_batches` 列出所有活跃批次，`recent_batches` 按创建时间倒序取前 `recent_limit` 个；
/// 只有汇总部分受选择影响。
pub fn build_dashboard(
    batches: &[Batch],
    selection: &SelectionContext,
    recent_limit: usize,
    now: DateTime<Utc>,
) -> DashboardSnapshot {
    let active_batches = batches
        .iter()
        .filter(|b| b.status.is_active())
        .map(|b| batch_progress(b, now))
        .collect();

    let mut recent: Vec<&Batch> = batches.iter().collect();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    let recent_batches = recent
        .into_iter()
        .take(recent_limit)
        .map(|b| batch_progress(b, now))
        .collect();

    DashboardSnapshot {
        summary_stats: summarize(batches, selection),
        active_batches,
        recent_batches,
    }
}

//! 日志工具模块
//!
//! 提供日志初始化和输出的辅助函数

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::{BatchProgress, DashboardSnapshot, SummaryStats, TaskStatus};
use crate::services::TrackKey;

/// 初始化日志
///
/// `RUST_LOG` 优先；未设置时默认 `info`，详细模式为 `debug`
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // 重复初始化（例如测试里）时忽略错误
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 程序配置
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 批次监控启动");
    info!("🌐 服务地址: {}", config.api_base_url);
    info!(
        "⏱️ 刷新间隔: {}ms / 对账延迟: {}ms / 期望 TTL: {}ms",
        config.dashboard_refresh_ms, config.reconcile_refresh_delay_ms, config.pending_ttl_ms
    );
    if !config.selection.trim().is_empty() {
        info!("🎯 选中批次: {}", config.selection);
    }
    info!("{}", "=".repeat(60));
}

fn format_rate(rate: Option<u8>) -> String {
    rate.map(|r| format!("{}%", r))
        .unwrap_or_else(|| "N/A".to_string())
}

fn log_summary(summary: &SummaryStats) {
    info!(
        "📊 [{}] {}: {} (活跃 {}) | 文档 {} | 响应 {} | 成功率 {}",
        summary.mode.as_str(),
        summary.mode.total_label(),
        summary.total_batches,
        summary.active_batches,
        summary.total_documents,
        summary.total_responses,
        format_rate(summary.success_rate)
    );
    if let Some(avg) = summary.average_processing_secs {
        info!("   平均处理时长: {:.1}s", avg);
    }
}

fn log_progress_line(progress: &BatchProgress) {
    let eta = progress
        .estimated_completion
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        "   {} {} [{}] {}% | {:.1} 文档/分钟 | 成功率 {} | 预计完成 {}",
        progress.id,
        truncate_text(&progress.name, 24),
        progress.status,
        progress.progress_percent,
        progress.throughput,
        format_rate(progress.success_rate),
        eta
    );
}

/// 输出仪表盘快照
pub fn log_dashboard(snapshot: &DashboardSnapshot) {
    info!("\n{}", "─".repeat(60));
    log_summary(&snapshot.summary_stats);

    if snapshot.active_batches.is_empty() {
        info!("💤 当前没有活跃批次");
    } else {
        info!("⚙️ 活跃批次 {} 个:", snapshot.active_batches.len());
        for progress in &snapshot.active_batches {
            log_progress_line(progress);
        }
    }

    if !snapshot.recent_batches.is_empty() {
        info!("🕘 最近批次:");
        for progress in &snapshot.recent_batches {
            log_progress_line(progress);
        }
    }
    info!("{}", "─".repeat(60));
}

/// 输出任务进度
///
/// # 参数
/// - `key`: 逻辑操作
/// - `status`: 最新任务状态
pub fn log_task_progress(key: &TrackKey, status: &TaskStatus) {
    match &status.error {
        Some(error) => warn!("❌ {} 失败: {}", key, truncate_text(error, 120)),
        None => info!("⏳ {} {:?} {}", key, status.status, status.progress_label()),
    }
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("批次监控", 2), "批次...");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(None), "N/A");
        assert_eq!(format_rate(Some(45)), "45%");
    }
}

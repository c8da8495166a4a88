//! 批次状态
//!
//! 内部只使用一个规范的枚举；历史遗留的单字母状态码（`P` / `PA` / `C` / `F`）
//! 以及 `processing` 只在序列化边界上翻译，状态机和聚合逻辑永远看不到它们。

use phf::phf_map;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 批次生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchStatus {
    /// 已保存配置，尚未暂存
    Saved,
    /// 等待暂存
    ReadyForStaging,
    /// 正在暂存（校验并分配文档）
    Staging,
    /// 暂存完成
    Staged,
    /// 正在分析
    Analyzing,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 暂存失败
    FailedStaging,
    /// 失败（终态）
    Failed,
}

/// 历史别名 → 规范状态
static LEGACY_ALIASES: phf::Map<&'static str, BatchStatus> = phf_map! {
    "P" => BatchStatus::Analyzing,
    "PROCESSING" => BatchStatus::Analyzing,
    "PA" => BatchStatus::Paused,
    "C" => BatchStatus::Completed,
    "F" => BatchStatus::Failed,
};

impl BatchStatus {
    pub const ALL: [BatchStatus; 9] = [
        BatchStatus::Saved,
        BatchStatus::ReadyForStaging,
        BatchStatus::Staging,
        BatchStatus::Staged,
        BatchStatus::Analyzing,
        BatchStatus::Paused,
        BatchStatus::Completed,
        BatchStatus::FailedStaging,
        BatchStatus::Failed,
    ];

    /// 规范的线上名称
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Saved => "SAVED",
            BatchStatus::ReadyForStaging => "READY_FOR_STAGING",
            BatchStatus::Staging => "STAGING",
            BatchStatus::Staged => "STAGED",
            BatchStatus::Analyzing => "ANALYZING",
            BatchStatus::Paused => "PAUSED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::FailedStaging => "FAILED_STAGING",
            BatchStatus::Failed => "FAILED",
        }
    }

    /// 解析状态字符串（支持历史别名，大小写不敏感）
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        if let Some(status) = LEGACY_ALIASES.get(normalized.as_str()) {
            return Some(*status);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == normalized)
    }

    /// 是否处于活跃状态（计入 active_only 聚合）
    pub fn is_active(self) -> bool {
        matches!(self, BatchStatus::Analyzing | BatchStatus::Staging)
    }

    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 无法识别的状态字符串
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "未知的批次状态: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for BatchStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl Serialize for BatchStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BatchStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, ConfigError, FileError};
use crate::models::dashboard::SelectionContext;
use crate::models::task::TaskKind;

/// 各类任务的轮询间隔（毫秒）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub stage_ms: u64,
    pub analysis_ms: u64,
    pub reset_ms: u64,
    pub snapshot_ms: u64,
    pub restore_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            stage_ms: 1_000,
            analysis_ms: 3_000,
            reset_ms: 1_000,
            snapshot_ms: 2_000,
            restore_ms: 2_000,
        }
    }
}

impl PollingConfig {
    /// 按任务类型取轮询间隔
    pub fn interval_for(&self, kind: TaskKind) -> Duration {
        let ms = match kind {
            TaskKind::Stage => self.stage_ms,
            TaskKind::RunAnalysis => self.analysis_ms,
            TaskKind::ResetDatabase => self.reset_ms,
            TaskKind::CreateSnapshot => self.snapshot_ms,
            TaskKind::RestoreSnapshot => self.restore_ms,
        };
        Duration::from_millis(ms)
    }

    fn all(&self) -> [(&'static str, u64); 5] {
        [
            ("polling.stage_ms", self.stage_ms),
            ("polling.analysis_ms", self.analysis_ms),
            ("polling.reset_ms", self.reset_ms),
            ("polling.snapshot_ms", self.snapshot_ms),
            ("polling.restore_ms", self.restore_ms),
        ]
    }
}

/// 程序配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 批次服务地址
    pub api_base_url: String,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 任务轮询间隔
    pub polling: PollingConfig,
    /// 仪表盘自动刷新间隔（毫秒）
    pub dashboard_refresh_ms: u64,
    /// 乐观更新后延迟多久再做权威刷新（毫秒）
    pub reconcile_refresh_delay_ms: u64,
    /// 乐观期望的最长存活时间（毫秒）
    pub pending_ttl_ms: u64,
    /// 仪表盘"最近批次"条数
    pub recent_batches_limit: usize,
    /// 逗号分隔的选中批次 ID
    pub selection: String,
    /// 批次配置 TOML 所在目录
    pub batch_config_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: 30,
            polling: PollingConfig::default(),
            dashboard_refresh_ms: 5_000,
            reconcile_refresh_delay_ms: 6_000,
            pending_ttl_ms: 10_000,
            recent_batches_limit: 10,
            selection: String::new(),
            batch_config_folder: "batch_configs".to_string(),
            verbose_logging: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    std::env::var(var_name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            api_base_url: std::env::var("BATCH_API_BASE_URL").unwrap_or(default.api_base_url),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", default.request_timeout_secs),
            polling: PollingConfig {
                stage_ms: env_parse("POLL_STAGE_MS", default.polling.stage_ms),
                analysis_ms: env_parse("POLL_ANALYSIS_MS", default.polling.analysis_ms),
                reset_ms: env_parse("POLL_RESET_MS", default.polling.reset_ms),
                snapshot_ms: env_parse("POLL_SNAPSHOT_MS", default.polling.snapshot_ms),
                restore_ms: env_parse("POLL_RESTORE_MS", default.polling.restore_ms),
            },
            dashboard_refresh_ms: env_parse("DASHBOARD_REFRESH_MS", default.dashboard_refresh_ms),
            reconcile_refresh_delay_ms: env_parse(
                "RECONCILE_REFRESH_DELAY_MS",
                default.reconcile_refresh_delay_ms,
            ),
            pending_ttl_ms: env_parse("PENDING_TTL_MS", default.pending_ttl_ms),
            recent_batches_limit: env_parse("RECENT_BATCHES_LIMIT", default.recent_batches_limit),
            selection: std::env::var("BATCH_SELECTION").unwrap_or(default.selection),
            batch_config_folder: std::env::var("BATCH_CONFIG_FOLDER")
                .unwrap_or(default.batch_config_folder),
            verbose_logging: env_parse("VERBOSE_LOGGING", default.verbose_logging),
        }
    }

    /// 从 TOML 文件加载，缺失字段使用默认值
    pub fn from_toml_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FileError::ReadFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| FileError::TomlParseFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(config)
    }

    /// 校验配置
    ///
    /// 期望 TTL 必须大于延迟刷新时间，否则期望总会在延迟刷新到达前过期
    pub fn validate(&self) -> AppResult<()> {
        let mut intervals = vec![
            ("dashboard_refresh_ms", self.dashboard_refresh_ms),
            ("pending_ttl_ms", self.pending_ttl_ms),
        ];
        intervals.extend(self.polling.all());

        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "必须大于 0".to_string(),
                }
                .into());
            }
        }

        if self.pending_ttl_ms <= self.reconcile_refresh_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "pending_ttl_ms".to_string(),
                reason: format!(
                    "必须大于 reconcile_refresh_delay_ms ({})",
                    self.reconcile_refresh_delay_ms
                ),
            }
            .into());
        }

        Ok(())
    }

    /// `memory://` 地址表示使用进程内的模拟服务端
    pub fn uses_memory_backend(&self) -> bool {
        self.api_base_url.starts_with("memory://")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dashboard_refresh(&self) -> Duration {
        Duration::from_millis(self.dashboard_refresh_ms)
    }

    pub fn reconcile_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.reconcile_refresh_delay_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }

    pub fn selection_context(&self) -> SelectionContext {
        SelectionContext::parse_list(&self.selection)
    }
}

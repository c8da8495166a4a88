//! 应用编排 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责组装和运行：
//!
//! 1. **应用初始化**：校验配置、选择服务端（HTTP 或进程内 `memory://`）、创建观察者会话
//! 2. **批量提交**：扫描批次配置文件夹，并发创建批次
//! 3. **持续观察**：自动刷新仪表盘，定期输出汇总，直到收到 Ctrl-C
//! 4. **资源清理**：退出时销毁会话，停止所有定时器
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单个批次的状态细节，全部委托给 `ViewerSession`
//! - **资源所有者**：唯一持有服务端连接的模块

use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::clients::HttpBatchClient;
use crate::config::Config;
use crate::error::AppResult;
use crate::models::{load_all_batch_configs, Batch, BatchConfig, BatchStatus};
use crate::services::{BatchApi, MemoryBackend};
use crate::utils::logging::{log_dashboard, log_startup, log_task_progress};
use crate::workflow::{ViewerSession, ViewerSettings};

/// 同时提交的批次配置数
const MAX_CONCURRENT_SUBMITS: usize = 4;

/// 进程内服务端每轮后台工作的间隔
const MEMORY_WORK_INTERVAL: Duration = Duration::from_secs(1);

/// 已提交配置文件的后缀
const SUBMITTED_SUFFIX: &str = "submitted";

/// 应用主结构
pub struct App {
    config: Config,
    viewer: ViewerSession,
    /// 仅在 `memory://` 模式下存在
    backend: Option<Arc<MemoryBackend>>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        config.validate()?;
        log_startup(&config);

        let backend = config.uses_memory_backend().then(|| {
            info!("🧪 使用进程内服务端");
            Arc::new(MemoryBackend::new(config.recent_batches_limit))
        });
        let api: Arc<dyn BatchApi> = match &backend {
            Some(backend) => backend.clone(),
            None => Arc::new(HttpBatchClient::new(&config)?),
        };

        let viewer = ViewerSession::new(api, ViewerSettings::from_config(&config));

        Ok(Self {
            config,
            viewer,
            backend,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        let submitted = self.submit_batch_configs().await?;
        if !submitted.is_empty() {
            info!("✓ 本次新建 {} 个批次", submitted.len());
        }

        if let Err(e) = self.viewer.refresh().await {
            warn!("⚠️ 首次刷新失败: {}", e.user_message());
        }
        self.viewer.start_auto_refresh();

        let mut report = interval(self.config.dashboard_refresh());
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut work = interval(MEMORY_WORK_INTERVAL);
        work.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                signal = &mut ctrl_c => {
                    if let Err(e) = signal {
                        error!("监听退出信号失败: {}", e);
                    }
                    info!("🛑 收到退出信号");
                    break;
                }
                _ = report.tick() => self.report().await,
                _ = work.tick(), if self.backend.is_some() => {
                    if let Some(backend) = &self.backend {
                        backend.advance();
                    }
                }
            }
        }

        self.viewer.shutdown();
        info!("👋 已停止所有定时器，程序结束");
        Ok(())
    }

    /// 提交配置文件夹中的所有批次配置
    async fn submit_batch_configs(&self) -> Result<Vec<Batch>> {
        let folder = &self.config.batch_config_folder;
        if !Path::new(folder).exists() {
            info!("📁 批次配置文件夹 {} 不存在，跳过提交", folder);
            return Ok(Vec::new());
        }

        info!("\n📁 正在扫描待提交的批次配置...");
        let configs = load_all_batch_configs(folder).await?;
        if configs.is_empty() {
            info!("没有待提交的批次配置");
            return Ok(Vec::new());
        }
        info!("✓ 找到 {} 个批次配置", configs.len());

        let viewer = &self.viewer;
        let results: Vec<(BatchConfig, AppResult<Batch>)> = stream::iter(configs)
            .map(|config| async move {
                let result = viewer.create_batch(&config).await;
                (config, result)
            })
            .buffer_unordered(MAX_CONCURRENT_SUBMITS)
            .collect()
            .await;

        let mut created = Vec::new();
        for (config, result) in results {
            match result {
                Ok(batch) => {
                    mark_submitted(&config).await;
                    if self.backend.is_some() && batch.status == BatchStatus::Saved {
                        // 演示模式下直接开始暂存
                        if let Err(e) = self.viewer.stage(&batch.id).await {
                            warn!("批次 {} 暂存失败: {}", batch.id, e.user_message());
                        }
                    }
                    created.push(batch);
                }
                Err(e) => error!("❌ 批次配置 {} 提交失败: {}", config.name, e.user_message()),
            }
        }
        Ok(created)
    }

    /// 输出一次仪表盘和进行中的任务
    async fn report(&self) {
        match self.viewer.dashboard().await {
            Some(snapshot) => log_dashboard(&snapshot),
            None => info!("⏳ 仪表盘尚未加载"),
        }
        for view in self.viewer.task_views().await {
            if let Some(status) = &view.latest {
                log_task_progress(&view.key, status);
            }
        }
    }

    pub fn viewer(&self) -> &ViewerSession {
        &self.viewer
    }
}

/// 把已提交的配置文件改名，避免下次启动重复提交
async fn mark_submitted(config: &BatchConfig) {
    let Some(path) = &config.file_path else {
        return;
    };
    let target = format!("{}.{}", path, SUBMITTED_SUFFIX);
    if let Err(e) = tokio::fs::rename(path, &target).await {
        warn!("⚠️ 无法标记已提交的配置 {}: {}", path, e);
    }
}

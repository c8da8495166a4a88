//! 观察者会话 - 流程层
//!
//! ## 职责
//!
//! 一个 [`ViewerSession`] 对应一个观察者（一个界面或一个终端），独占：
//!
//! - 自己的 [`TaskTracker`] 和 [`Reconciler`]
//! - 仪表盘自动刷新循环
//! - 事件消费循环（任务进度 → 通知 / 刷新）
//! - 乐观更新之后的延迟刷新定时器
//!
//! 观察者之间不共享任何可变状态，只通过服务端的权威状态收敛。
//!
//! ## 用户动作流程
//!
//! ```text
//! 本地预检 ──✗──→ StateConflict（不修改、不发请求）
//!    │✓
//! 乐观更新 + 记录期望
//!    │
//! 发出请求 ──✗──→ 回滚 + 通知
//!    │✓
//! 任务句柄? ──无效──→ 回滚 + "没有有效的任务"
//!    │
//! 开始轮询 / 安排延迟刷新
//! ```
//!
//! ## 销毁
//!
//! `shutdown()`（或 drop）确定性地停止所有定时器：任务轮询、自动刷新、延迟刷新和事件消费。

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, PollingConfig};
use crate::error::{AppError, AppResult, ValidationError};
use crate::lifecycle::{self, InFlightSet, LifecycleAction};
use crate::models::{
    ActionOutcome, Batch, BatchConfig, BatchFilter, BatchId, DashboardSnapshot, SelectionContext,
    SummaryStats, TaskHandle, TaskId, TaskKind, TaskState, TaskStatus,
};
use crate::services::{
    aggregation, BatchApi, ReconcileOutcome, Reconciler, TaskEvent, TaskTracker, TaskUpdate,
    TrackKey,
};
use crate::utils::logging::log_task_progress;

/// 破坏性动作的用户确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

impl Confirmation {
    fn require(self, action: &str) -> AppResult<()> {
        match self {
            Confirmation::Confirmed => Ok(()),
            Confirmation::Declined => Err(ValidationError::ConfirmationRequired {
                action: action.to_string(),
            }
            .into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// 面向用户的提示
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// 正在追踪的任务（用于显示处理中指示和进度条）
#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub key: TrackKey,
    pub task_id: TaskId,
    pub generation: u64,
    pub latest: Option<TaskStatus>,
}

/// 会话参数
#[derive(Debug, Clone)]
pub struct ViewerSettings {
    pub refresh_interval: Duration,
    pub reconcile_delay: Duration,
    pub pending_ttl: Duration,
    pub polling: PollingConfig,
    pub selection: SelectionContext,
    pub notice_limit: usize,
}

impl ViewerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_interval: config.dashboard_refresh(),
            reconcile_delay: config.reconcile_refresh_delay(),
            pending_ttl: config.pending_ttl(),
            polling: config.polling.clone(),
            selection: config.selection_context(),
            notice_limit: 20,
        }
    }
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// 一次刷新的结果
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub outcomes: HashMap<BatchId, ReconcileOutcome>,
    /// 计数不变量不成立的批次
    pub inconsistent: Vec<BatchId>,
    /// 拉取期间本地已应用了更新的数据，本次结果被丢弃
    pub stale: bool,
}

impl RefreshReport {
    pub fn outcome(&self, id: &BatchId) -> Option<ReconcileOutcome> {
        self.outcomes.get(id).copied()
    }
}

struct ViewerState {
    batches: HashMap<BatchId, Batch>,
    reconciler: Reconciler,
    selection: SelectionContext,
    dashboard: Option<DashboardSnapshot>,
    tasks: HashMap<TrackKey, TaskView>,
    notices: VecDeque<Notice>,
    notice_limit: usize,
    last_refresh: Option<DateTime<Utc>>,
    /// 最近一次写入本地批次表的序号
    applied_seq: u64,
}

impl ViewerState {
    fn new(settings: &ViewerSettings) -> Self {
        Self {
            batches: HashMap::new(),
            reconciler: Reconciler::new(settings.pending_ttl),
            selection: settings.selection.clone(),
            dashboard: None,
            tasks: HashMap::new(),
            notices: VecDeque::new(),
            notice_limit: settings.notice_limit.max(1),
            last_refresh: None,
            applied_seq: 0,
        }
    }

    /// 记录一次写入；序号早于已写入数据的结果返回 false
    fn advance_seq(&mut self, seq: u64) -> bool {
        if seq < self.applied_seq {
            return false;
        }
        self.applied_seq = seq;
        true
    }

    fn notify(&mut self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info => info!("💬 {}", message),
            NoticeLevel::Warning => warn!("💬 {}", message),
            NoticeLevel::Error => error!("💬 {}", message),
        }
        self.notices.push_back(Notice {
            level,
            message,
            at: Utc::now(),
        });
        while self.notices.len() > self.notice_limit {
            self.notices.pop_front();
        }
    }

    /// 任务结束：移除任务视图，批次的期望已被任务结果取代
    fn settle_task(&mut self, key: &TrackKey) {
        self.tasks.remove(key);
        if let Some(batch_id) = &key.batch_id {
            self.reconciler.discard(batch_id);
        }
    }

    /// 撤销乐观更新
    fn rollback(&mut self, batch_id: &BatchId) {
        let ViewerState {
            batches,
            reconciler,
            ..
        } = self;
        match batches.get_mut(batch_id) {
            Some(batch) => {
                reconciler.rollback(batch);
            }
            None => {
                reconciler.discard(batch_id);
            }
        }
    }
}

/// 会话内各后台任务共享的部分
struct Shared {
    api: Arc<dyn BatchApi>,
    tracker: TaskTracker,
    state: Mutex<ViewerState>,
    settings: ViewerSettings,
    /// 刷新和本地权威写入共用的递增序号
    seq: AtomicU64,
}

impl Shared {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 拉取权威数据并与本地状态对账
    ///
    /// 序号在发出请求前取得；晚到的旧结果不会覆盖更新的数据
    async fn refresh(&self) -> AppResult<RefreshReport> {
        let seq = self.next_seq();
        let selection = self.state.lock().await.selection.clone();
        let server = self.api.list_batches(&BatchFilter::default()).await?;
        let dashboard = self.api.get_dashboard(&selection).await?;

        let inconsistent = inconsistent_batches(&server);

        let mut state = self.state.lock().await;
        if !state.advance_seq(seq) {
            debug!(
                "丢弃过期的刷新结果 (序号 {} < {})",
                seq, state.applied_seq
            );
            return Ok(RefreshReport {
                inconsistent,
                stale: true,
                ..Default::default()
            });
        }
        let outcomes = {
            let ViewerState {
                batches,
                reconciler,
                ..
            } = &mut *state;
            reconciler.reconcile_all(batches, server)
        };

        let mut expired: Vec<(BatchId, String)> = outcomes
            .iter()
            .filter(|(_, outcome)| **outcome == ReconcileOutcome::Expired)
            .map(|(id, _)| {
                let status = state
                    .batches
                    .get(id)
                    .map(|b| b.status.to_string())
                    .unwrap_or_default();
                (id.clone(), status)
            })
            .collect();
        expired.sort();
        for (id, status) in expired {
            state.notify(
                NoticeLevel::Warning,
                format!("批次 {} 的状态变更未被服务端确认，已恢复为 {}", id, status),
            );
        }

        state.dashboard = Some(dashboard);
        state.last_refresh = Some(Utc::now());
        debug!("刷新完成: {} 个批次", state.batches.len());

        Ok(RefreshReport {
            outcomes,
            inconsistent,
            stale: false,
        })
    }

    async fn refresh_logged(&self, reason: &str) {
        if let Err(e) = self.refresh().await {
            warn!("{}刷新失败: {}", reason, e);
        }
    }

    async fn handle_event(&self, event: TaskEvent) {
        // 旧会话残留的事件
        if !self.tracker.is_current(&event.key, event.generation) {
            debug!(
                "丢弃 {} 的过期事件 (任务 {}, 代数 {})",
                event.key, event.task_id, event.generation
            );
            return;
        }

        let finished = {
            let mut state = self.state.lock().await;
            match &event.update {
                TaskUpdate::Progress(status) => {
                    log_task_progress(&event.key, status);
                    if let Some(view) = state.tasks.get_mut(&event.key) {
                        view.latest = Some(status.clone());
                    }
                    false
                }
                TaskUpdate::Finished(status) => {
                    log_task_progress(&event.key, status);
                    self.tracker.retire(&event.key, event.generation);
                    state.settle_task(&event.key);
                    state.advance_seq(self.next_seq());
                    match status.status {
                        TaskState::Completed => {
                            state.notify(NoticeLevel::Info, format!("✅ {} 已完成", event.key))
                        }
                        _ => state.notify(
                            NoticeLevel::Error,
                            format!(
                                "❌ {} 失败: {}",
                                event.key,
                                status.error.as_deref().unwrap_or("未知错误")
                            ),
                        ),
                    }
                    true
                }
                TaskUpdate::Invalid => {
                    self.tracker.retire(&event.key, event.generation);
                    state.settle_task(&event.key);
                    state.advance_seq(self.next_seq());
                    state.notify(
                        NoticeLevel::Error,
                        AppError::invalid_task(event.task_id.as_str()).user_message(),
                    );
                    true
                }
            }
        };

        if finished {
            self.refresh_logged("任务结束后").await;
        }
    }
}

/// 计数不变量检查
fn inconsistent_batches(batches: &[Batch]) -> Vec<BatchId> {
    batches
        .iter()
        .filter(|batch| !batch.counts_consistent())
        .map(|batch| {
            warn!(
                "⚠️ 批次 {} 计数不一致: 文档 {:?} / 响应 {:?}",
                batch.id, batch.document_counts, batch.response_counts
            );
            batch.id.clone()
        })
        .collect()
}

async fn consume_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TaskEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle_event(event).await;
    }
}

/// 观察者会话
pub struct ViewerSession {
    shared: Arc<Shared>,
    in_flight: InFlightSet,
    refresh_loop: StdMutex<Option<JoinHandle<()>>>,
    timers: StdMutex<Vec<JoinHandle<()>>>,
}

impl ViewerSession {
    /// 创建会话并启动事件消费循环（必须在 tokio 运行时内调用）
    pub fn new(api: Arc<dyn BatchApi>, settings: ViewerSettings) -> Self {
        let (tracker, events) = TaskTracker::new(api.clone(), settings.polling.clone());
        let shared = Arc::new(Shared {
            api,
            tracker,
            state: Mutex::new(ViewerState::new(&settings)),
            settings,
            seq: AtomicU64::new(0),
        });

        let consumer = tokio::spawn(consume_events(shared.clone(), events));
        Self {
            shared,
            in_flight: InFlightSet::new(),
            refresh_loop: StdMutex::new(None),
            timers: StdMutex::new(vec![consumer]),
        }
    }

    fn push_timer(&self, handle: JoinHandle<()>) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.retain(|timer| !timer.is_finished());
        timers.push(handle);
    }

    // ========== 定时器 ==========

    /// 启动仪表盘自动刷新；已在运行时先停止旧循环
    pub fn start_auto_refresh(&self) {
        let shared = self.shared.clone();
        let period = shared.settings.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.refresh_logged("自动").await;
            }
        });

        let mut slot = self.refresh_loop.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        info!("🔁 自动刷新已启动 (间隔 {:?})", period);
    }

    pub fn stop_auto_refresh(&self) {
        let mut slot = self.refresh_loop.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// 乐观更新后安排一次延迟刷新，用于确认或推翻期望
    fn schedule_reconcile_refresh(&self) {
        let shared = self.shared.clone();
        let delay = shared.settings.reconcile_delay;
        self.push_timer(tokio::spawn(async move {
            sleep(delay).await;
            shared.refresh_logged("延迟").await;
        }));
    }

    /// 仍在运行的定时器数：任务轮询 + 自动刷新 + 延迟刷新 + 事件消费
    pub fn active_timers(&self) -> usize {
        let polling = self.shared.tracker.active_sessions();
        let refresh = self
            .refresh_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| usize::from(!h.is_finished()))
            .unwrap_or(0);
        let timers = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count();
        polling + refresh + timers
    }

    /// 停止本会话的所有定时器
    pub fn shutdown(&self) {
        self.shared.tracker.cancel_all();
        self.stop_auto_refresh();
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for timer in timers.drain(..) {
            timer.abort();
        }
        debug!("观察者会话已销毁");
    }

    // ========== 查询 ==========

    pub async fn refresh(&self) -> AppResult<RefreshReport> {
        self.shared.refresh().await
    }

    /// 切换选中批次并立即刷新
    pub async fn select(&self, selection: SelectionContext) -> AppResult<RefreshReport> {
        self.shared.state.lock().await.selection = selection;
        self.shared.refresh().await
    }

    pub async fn selection(&self) -> SelectionContext {
        self.shared.state.lock().await.selection.clone()
    }

    pub async fn batch(&self, id: &BatchId) -> Option<Batch> {
        self.shared.state.lock().await.batches.get(id).cloned()
    }

    /// 本地批次（含乐观值），按创建时间倒序
    pub async fn batches(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .shared
            .state
            .lock()
            .await
            .batches
            .values()
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        batches
    }

    /// 最近一次从服务端拿到的仪表盘
    pub async fn dashboard(&self) -> Option<DashboardSnapshot> {
        self.shared.state.lock().await.dashboard.clone()
    }

    /// 基于本地数据（含乐观值）的即时汇总
    pub async fn local_summary(&self) -> SummaryStats {
        let state = self.shared.state.lock().await;
        let batches: Vec<Batch> = state.batches.values().cloned().collect();
        aggregation::summarize(&batches, &state.selection)
    }

    pub async fn notices(&self) -> Vec<Notice> {
        self.shared.state.lock().await.notices.iter().cloned().collect()
    }

    /// 取走并清空通知
    pub async fn take_notices(&self) -> Vec<Notice> {
        self.shared.state.lock().await.notices.drain(..).collect()
    }

    pub async fn task_views(&self) -> Vec<TaskView> {
        self.shared.state.lock().await.tasks.values().cloned().collect()
    }

    /// 批次是否有任务在处理中
    pub async fn is_processing(&self, id: &BatchId) -> bool {
        self.shared
            .state
            .lock()
            .await
            .tasks
            .keys()
            .any(|key| key.batch_id.as_ref() == Some(id))
    }

    pub async fn has_pending(&self, id: &BatchId) -> bool {
        self.shared.state.lock().await.reconciler.has_pending(id)
    }

    /// 当前可用的用户动作；请求处理中的批次没有可用动作
    pub async fn available_actions(&self, id: &BatchId) -> Vec<LifecycleAction> {
        if self.in_flight.contains(id) {
            return Vec::new();
        }
        match self.shared.state.lock().await.batches.get(id) {
            Some(batch) => lifecycle::available_actions(batch.status),
            None => Vec::new(),
        }
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().await.last_refresh
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.shared.tracker
    }

    // ========== 批次 ==========

    /// 校验后创建批次；校验失败不发请求
    pub async fn create_batch(&self, config: &BatchConfig) -> AppResult<Batch> {
        config.validate()?;
        let batch = self.shared.api.create_batch(config).await?;

        let mut state = self.shared.state.lock().await;
        state.advance_seq(self.shared.next_seq());
        state.notify(
            NoticeLevel::Info,
            format!("📦 已创建批次 {} ({})", batch.id, batch.name),
        );
        state.batches.insert(batch.id.clone(), batch.clone());
        Ok(batch)
    }

    /// 删除（归档）批次，需要用户确认
    pub async fn delete_batch(
        &self,
        id: &BatchId,
        reason: &str,
        confirmation: Confirmation,
    ) -> AppResult<()> {
        confirmation.require("delete")?;
        let _guard = self.in_flight.acquire(id)?;

        if let Err(e) = self.shared.api.delete_batch(id, reason).await {
            self.shared
                .state
                .lock()
                .await
                .notify(NoticeLevel::Error, e.user_message());
            return Err(e);
        }

        for kind in [TaskKind::Stage, TaskKind::RunAnalysis] {
            self.shared.tracker.cancel(&TrackKey::for_batch(kind, id));
        }

        let mut state = self.shared.state.lock().await;
        state.advance_seq(self.shared.next_seq());
        state.batches.remove(id);
        state.reconciler.discard(id);
        state.tasks.retain(|key, _| key.batch_id.as_ref() != Some(id));
        state.notify(NoticeLevel::Info, format!("🗄️ 批次 {} 已归档删除", id));
        Ok(())
    }

    // ========== 生命周期动作 ==========

    /// 执行非破坏性用户动作；破坏性动作请使用带确认的专用方法
    pub async fn perform(&self, id: &BatchId, action: LifecycleAction) -> AppResult<ActionOutcome> {
        if action.is_destructive() {
            return Err(ValidationError::ConfirmationRequired {
                action: action.to_string(),
            }
            .into());
        }
        self.execute(id, action).await
    }

    pub async fn stage(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Stage).await
    }

    pub async fn run_analysis(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::RunAnalysis).await
    }

    pub async fn pause(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Pause).await
    }

    pub async fn resume(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Resume).await
    }

    pub async fn rerun(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Rerun).await
    }

    pub async fn restage_and_rerun(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::RestageAndRerun).await
    }

    pub async fn reset_to_prestage(
        &self,
        id: &BatchId,
        confirmation: Confirmation,
    ) -> AppResult<ActionOutcome> {
        confirmation.require(LifecycleAction::ResetToPrestage.as_str())?;
        self.execute(id, LifecycleAction::ResetToPrestage).await
    }

    /// 启动并追踪维护任务
    pub async fn start_maintenance(&self, kind: TaskKind, params: JsonValue) -> AppResult<TaskHandle> {
        if !kind.is_maintenance() {
            return Err(ValidationError::Rejected {
                message: format!("{} 不是维护任务", kind),
            }
            .into());
        }
        let handle = self.shared.tracker.start(kind, params).await?;
        self.begin_tracking(TrackKey::maintenance(kind), &handle)
            .await?;
        Ok(handle)
    }

    async fn ensure_loaded(&self, id: &BatchId) -> AppResult<()> {
        if self.shared.state.lock().await.batches.contains_key(id) {
            return Ok(());
        }
        let batch = self.shared.api.get_batch(id).await?;
        self.shared
            .state
            .lock()
            .await
            .batches
            .entry(id.clone())
            .or_insert(batch);
        Ok(())
    }

    async fn execute(&self, id: &BatchId, action: LifecycleAction) -> AppResult<ActionOutcome> {
        if !action.is_user_action() {
            return Err(ValidationError::Rejected {
                message: format!("{} 是系统事件，不能由用户触发", action),
            }
            .into());
        }

        // 同一批次同一时刻只允许一个状态变更请求
        let _guard = self.in_flight.acquire(id)?;
        self.ensure_loaded(id).await?;

        let expected = {
            let mut state = self.shared.state.lock().await;
            let ViewerState {
                batches,
                reconciler,
                ..
            } = &mut *state;
            let batch = batches
                .get_mut(id)
                .ok_or_else(|| AppError::not_found(id.as_str()))?;
            let transition = lifecycle::transition(id, batch.status, action)?;
            reconciler.apply_optimistic(batch, transition.to);
            transition.to
        };
        info!("👆 批次 {} 执行 {} (预期 {})", id, action, expected);

        let outcome = match self.shared.api.perform(id, action).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut state = self.shared.state.lock().await;
                state.rollback(id);
                state.notify(NoticeLevel::Error, e.user_message());
                return Err(e);
            }
        };

        match &outcome {
            ActionOutcome::Task(handle) => {
                let key = TrackKey::for_batch(handle.kind, id);
                if let Err(e) = self.begin_tracking(key, handle).await {
                    self.shared.state.lock().await.rollback(id);
                    return Err(e);
                }
            }
            ActionOutcome::Status(status) if *status != expected => {
                // 服务端同步返回了不同的状态，以服务端为准
                let mut state = self.shared.state.lock().await;
                state.advance_seq(self.shared.next_seq());
                state.reconciler.discard(id);
                if let Some(batch) = state.batches.get_mut(id) {
                    batch.status = *status;
                }
            }
            _ => {}
        }

        self.schedule_reconcile_refresh();
        Ok(outcome)
    }

    async fn begin_tracking(&self, key: TrackKey, handle: &TaskHandle) -> AppResult<()> {
        let tracked = self.shared.tracker.track(key.clone(), handle);
        let mut state = self.shared.state.lock().await;
        match (tracked, handle.task_id.clone()) {
            (Ok(generation), Some(task_id)) => {
                state.notify(
                    NoticeLevel::Info,
                    format!("🚀 {} 已启动 (任务 {})", key, task_id),
                );
                state.tasks.insert(
                    key.clone(),
                    TaskView {
                        key,
                        task_id,
                        generation,
                        latest: None,
                    },
                );
                Ok(())
            }
            (Ok(_), None) => Err(AppError::NoTask { kind: handle.kind }),
            (Err(e), _) => {
                state.notify(NoticeLevel::Warning, e.user_message());
                Err(e)
            }
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

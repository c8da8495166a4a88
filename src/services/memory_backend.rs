//! 内存版批次服务 - 业务能力层
//!
//! 服务端的权威实现：持有批次表、任务表、归档和快照，所有状态转换都经过
//! [`lifecycle::transition`]，不合法的组合返回 `StateConflict`（相当于 HTTP 409）。
//!
//! ## 职责
//!
//! - 实现 [`BatchApi`]，供离线运行和测试使用
//! - 模拟后台工作：推进任务进度、逐条处理响应（[`MemoryBackend::advance`]）
//! - 任务读到终态一次后即回收，之后再查询返回 `InvalidTask`
//! - 故障注入（[`BackendFaults`]）：丢弃任务 ID、搁置转换、服务不可用、请求延迟

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, StateConflict, ValidationError};
use crate::lifecycle::{self, InFlightSet, LifecycleAction, Transition};
use crate::models::{
    ActionOutcome, Batch, BatchConfig, BatchFilter, BatchId, BatchStatus, DashboardSnapshot,
    Document, DocumentCounts, Page, Response, ResponseCounts, ResponseQuery, ResponseStatus,
    SelectionContext, TaskHandle, TaskId, TaskKind, TaskState, TaskStatus,
};
use crate::services::aggregation;
use crate::services::api::BatchApi;

/// 模拟任务的总步数
const TASK_STEPS: u32 = 5;
/// 单页最多返回的响应数
const MAX_PAGE_LIMIT: usize = 500;
const DEFAULT_PROMPT: &str = "default-prompt";
const DEFAULT_CONNECTION: &str = "default-connection";

/// 故障注入开关
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendFaults {
    /// 启动任务的动作返回空任务 ID，且不执行转换
    pub drop_task_ids: bool,
    /// 受理动作但不执行转换（服务端永远不确认）
    pub stall_transitions: bool,
    /// 所有请求返回瞬时网络错误
    pub unavailable: bool,
    /// 状态变更请求在占用批次后的处理延迟
    pub latency: Duration,
}

/// 删除前归档的批次
#[derive(Debug, Clone)]
pub struct ArchivedBatch {
    pub batch: Batch,
    pub documents: Vec<Document>,
    pub reason: String,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredBatch {
    batch: Batch,
    documents: Vec<Document>,
    prompt_ids: Vec<String>,
    connection_ids: Vec<String>,
    /// 已结束的处理区间累计秒数
    accumulated_secs: u64,
    /// 当前处理区间的开始时间（Staging / Analyzing 期间）
    running_since: Option<DateTime<Utc>>,
}

impl StoredBatch {
    fn responses(&self) -> impl Iterator<Item = &Response> {
        self.documents.iter().flat_map(|d| d.responses.iter())
    }

    fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        let running = self
            .running_since
            .map(|since| (now - since).num_seconds().max(0) as u64)
            .unwrap_or(0);
        self.accumulated_secs + running
    }

    /// 带实时计数的对外视图
    fn view(&self, now: DateTime<Utc>) -> Batch {
        let mut batch = self.batch.clone();
        batch.document_counts = DocumentCounts::from_documents(&self.documents);
        batch.response_counts = ResponseCounts::from_responses(self.responses());
        batch.elapsed_seconds = self.elapsed_secs(now);
        batch.estimated_completion = aggregation::estimated_completion(&batch, now);
        batch
    }

    /// 为没有响应的文档分配 (提示词 × 连接) 响应槽位
    fn assign_responses(&mut self) {
        for document in &mut self.documents {
            if !document.responses.is_empty() {
                continue;
            }
            for prompt in &self.prompt_ids {
                for connection in &self.connection_ids {
                    document.responses.push(Response::waiting(
                        format!("{}-{}-{}", document.id, prompt, connection),
                        document.id.clone(),
                        prompt.clone(),
                        connection.clone(),
                    ));
                }
            }
        }
    }

    fn all_responses_finished(&self) -> bool {
        self.responses().all(|r| r.status.is_finished())
    }

    fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) {
        let effects = transition.effects;

        if effects.unassign_documents {
            for document in &mut self.documents {
                document.responses.clear();
            }
        } else if effects.clear_responses {
            for response in self.documents.iter_mut().flat_map(|d| d.responses.iter_mut()) {
                *response = Response::waiting(
                    response.id.clone(),
                    response.document_id.clone(),
                    response.prompt_id.clone(),
                    response.connection_id.clone(),
                );
            }
        }
        if effects.revalidate_documents {
            debug!(
                "重新校验批次 {} 的 {} 个文档",
                self.batch.id,
                self.documents.len()
            );
        }
        if effects.clear_progress {
            self.accumulated_secs = 0;
            self.running_since = None;
        }

        match (transition.from.is_active(), transition.to.is_active()) {
            (true, false) => {
                if let Some(since) = self.running_since.take() {
                    self.accumulated_secs += (now - since).num_seconds().max(0) as u64;
                }
            }
            (false, true) => self.running_since = Some(now),
            _ => {}
        }

        self.batch.status = transition.to;
    }
}

#[derive(Debug, Clone)]
struct TaskRecord {
    kind: TaskKind,
    batch_id: Option<BatchId>,
    /// 启动任务的用户动作；维护任务为 None
    origin: Option<LifecycleAction>,
    params: JsonValue,
    step: u32,
    status: TaskStatus,
}

#[derive(Debug, Default)]
struct BackendState {
    batches: BTreeMap<BatchId, StoredBatch>,
    tasks: HashMap<TaskId, TaskRecord>,
    archive: Vec<ArchivedBatch>,
    snapshots: HashMap<String, BTreeMap<BatchId, StoredBatch>>,
    faults: BackendFaults,
    next_batch: u64,
    next_task: u64,
}

fn snapshot_name(params: &JsonValue) -> String {
    params
        .get("name")
        .and_then(JsonValue::as_str)
        .unwrap_or("default")
        .to_string()
}

/// 模拟第 `index` 条响应的处理结果：每 7 条失败一条
fn simulated_outcome(index: usize) -> (ResponseStatus, Option<u8>) {
    if index % 7 == 6 {
        (ResponseStatus::Failed, None)
    } else {
        (ResponseStatus::Succeeded, Some((40 + index * 17 % 60) as u8))
    }
}

impl BackendState {
    fn stored(&self, id: &BatchId) -> AppResult<&StoredBatch> {
        self.batches
            .get(id)
            .ok_or_else(|| AppError::not_found(id.as_str()))
    }

    fn stored_mut(&mut self, id: &BatchId) -> AppResult<&mut StoredBatch> {
        self.batches
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(id.as_str()))
    }

    fn spawn_task(
        &mut self,
        kind: TaskKind,
        batch_id: Option<BatchId>,
        origin: Option<LifecycleAction>,
        params: JsonValue,
    ) -> AppResult<TaskId> {
        self.next_task += 1;
        let raw = format!("task-{}", self.next_task);
        let task_id = TaskId::parse(&raw).ok_or_else(|| AppError::invalid_task(raw.clone()))?;

        self.tasks.insert(
            task_id.clone(),
            TaskRecord {
                kind,
                batch_id,
                origin,
                params,
                step: 0,
                status: TaskStatus::new(TaskState::Queued, 0),
            },
        );
        debug!("创建任务 {} ({})", task_id, kind);
        Ok(task_id)
    }

    /// 执行一个系统事件
    fn fire(
        &mut self,
        batch_id: &BatchId,
        event: LifecycleAction,
        now: DateTime<Utc>,
    ) -> AppResult<BatchStatus> {
        let stored = self.stored_mut(batch_id)?;
        let transition = lifecycle::transition(batch_id, stored.batch.status, event)?;
        if event == LifecycleAction::StagingSucceeded {
            stored.assign_responses();
        }
        stored.apply(&transition, now);
        info!(
            "🔄 批次 {}: {} → {} ({})",
            batch_id, transition.from, transition.to, event
        );
        Ok(transition.to)
    }

    fn analysis_task_running(&self, batch_id: &BatchId) -> bool {
        self.tasks.values().any(|task| {
            task.kind == TaskKind::RunAnalysis
                && task.batch_id.as_ref() == Some(batch_id)
                && !task.status.status.is_terminal()
        })
    }

    /// 分析任务结束且所有响应都已处理时完成批次
    fn complete_analysis_if_done(&mut self, batch_id: &BatchId, now: DateTime<Utc>) {
        let ready = match self.batches.get(batch_id) {
            Some(stored) => {
                stored.batch.status == BatchStatus::Analyzing && stored.all_responses_finished()
            }
            None => false,
        };
        if ready && !self.analysis_task_running(batch_id) {
            if let Err(e) = self.fire(batch_id, LifecycleAction::AnalysisCompleted, now) {
                warn!("批次 {} 无法标记为完成: {}", batch_id, e);
            }
        }
    }

    /// 任务结束后对所属批次执行对应的系统事件
    fn apply_task_result(&mut self, record: &TaskRecord, batch_id: &BatchId, ok: bool, now: DateTime<Utc>) {
        let event = match (record.kind, ok) {
            (TaskKind::Stage, true) => LifecycleAction::StagingSucceeded,
            (TaskKind::Stage, false) => LifecycleAction::StagingFailed,
            (TaskKind::RunAnalysis, true) => {
                self.complete_analysis_if_done(batch_id, now);
                return;
            }
            (TaskKind::RunAnalysis, false) => LifecycleAction::AnalysisFailed,
            _ => return,
        };
        if let Err(e) = self.fire(batch_id, event, now) {
            warn!("任务结束后批次 {} 状态未更新: {}", batch_id, e);
            return;
        }

        // 重新暂存完成后接着重跑分析
        if event == LifecycleAction::StagingSucceeded
            && record.origin == Some(LifecycleAction::RestageAndRerun)
        {
            if let Err(e) = self.rerun_after_restage(batch_id, now) {
                warn!("批次 {} 重新暂存后无法开始分析: {}", batch_id, e);
            }
        }
    }

    fn rerun_after_restage(&mut self, batch_id: &BatchId, now: DateTime<Utc>) -> AppResult<()> {
        self.fire(batch_id, LifecycleAction::RunAnalysis, now)?;
        let task_id = self.spawn_task(
            TaskKind::RunAnalysis,
            Some(batch_id.clone()),
            Some(LifecycleAction::RunAnalysis),
            JsonValue::Null,
        )?;
        debug!("批次 {} 重跑分析任务 {}", batch_id, task_id);
        Ok(())
    }

    /// 把任务置为终态；维护任务在这里产生实际效果
    fn settle_task(
        &mut self,
        task_id: &TaskId,
        result: Result<(), String>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let record = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| AppError::invalid_task(task_id.as_str()))?;
        if record.status.status.is_terminal() {
            return Ok(());
        }

        let result = match (record.kind, result) {
            (_, Err(e)) => Err(e),
            (TaskKind::ResetDatabase, Ok(())) => {
                info!("🧹 重置数据库，清除 {} 个批次", self.batches.len());
                self.batches.clear();
                Ok(())
            }
            (TaskKind::CreateSnapshot, Ok(())) => {
                let name = snapshot_name(&record.params);
                info!("📸 创建快照 {} ({} 个批次)", name, self.batches.len());
                self.snapshots.insert(name, self.batches.clone());
                Ok(())
            }
            (TaskKind::RestoreSnapshot, Ok(())) => {
                let name = snapshot_name(&record.params);
                match self.snapshots.get(&name) {
                    Some(snapshot) => {
                        info!("♻️ 从快照 {} 恢复 {} 个批次", name, snapshot.len());
                        self.batches = snapshot.clone();
                        Ok(())
                    }
                    None => Err(format!("快照 {} 不存在", name)),
                }
            }
            (_, Ok(())) => Ok(()),
        };

        let status = match &result {
            Ok(()) => TaskStatus::new(TaskState::Completed, 100).with_steps(TASK_STEPS, TASK_STEPS),
            Err(e) => TaskStatus::new(TaskState::Error, record.status.progress_percent)
                .with_steps(record.step, TASK_STEPS)
                .with_error(e.clone()),
        };
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = status;
        }

        if let Some(batch_id) = &record.batch_id {
            self.apply_task_result(&record, batch_id, result.is_ok(), now);
        }
        Ok(())
    }

    /// 任务前进一步；所属批次状态已变化时终止任务
    fn step_task(&mut self, task_id: &TaskId, now: DateTime<Utc>) -> AppResult<()> {
        let record = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| AppError::invalid_task(task_id.as_str()))?;
        if record.status.status.is_terminal() {
            return Ok(());
        }

        if let Some(batch_id) = &record.batch_id {
            let status = self.batches.get(batch_id).map(|b| b.batch.status);
            match (record.kind, status) {
                (TaskKind::Stage, Some(BatchStatus::Staging)) => {}
                (TaskKind::RunAnalysis, Some(BatchStatus::Analyzing)) => {}
                // 暂停期间任务不前进
                (TaskKind::RunAnalysis, Some(BatchStatus::Paused)) => return Ok(()),
                _ => {
                    return self.settle_task(
                        task_id,
                        Err(format!("批次 {} 状态已变化，任务终止", batch_id)),
                        now,
                    )
                }
            }
        }

        let step = record.step + 1;
        if step >= TASK_STEPS {
            return self.settle_task(task_id, Ok(()), now);
        }
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.step = step;
            task.status = TaskStatus::new(TaskState::Running, (step * 100 / TASK_STEPS) as u8)
                .with_steps(step, TASK_STEPS);
        }
        Ok(())
    }

    fn process_next_response(
        &mut self,
        batch_id: &BatchId,
        outcome: ResponseStatus,
        score: Option<u8>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<String>> {
        if !outcome.is_finished() {
            return Err(ValidationError::Rejected {
                message: format!("响应结果必须是终态，实际为 {:?}", outcome),
            }
            .into());
        }

        let stored = self.stored_mut(batch_id)?;
        if stored.batch.status != BatchStatus::Analyzing {
            return Err(StateConflict::Rejected {
                batch_id: batch_id.to_string(),
                message: format!("批次当前状态 {} 不处理响应", stored.batch.status),
            }
            .into());
        }

        let next = stored
            .documents
            .iter_mut()
            .flat_map(|d| d.responses.iter_mut())
            .find(|r| !r.status.is_finished());
        let Some(response) = next else {
            return Ok(None);
        };

        let started = response.started_at.unwrap_or(now);
        response.started_at = Some(started);
        response.completed_at = Some(now);
        response.status = outcome;
        response.suitability_score = score;
        response.processing_ms = Some((now - started).num_milliseconds().max(0) as u64);
        let response_id = response.id.clone();

        self.complete_analysis_if_done(batch_id, now);
        Ok(Some(response_id))
    }
}

/// 内存版批次服务
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    in_flight: InFlightSet,
    recent_limit: usize,
}

impl MemoryBackend {
    pub fn new(recent_limit: usize) -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            in_flight: InFlightSet::new(),
            recent_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> AppResult<()> {
        if self.lock().faults.unavailable {
            return Err(AppError::transient("memory://", "服务暂时不可用"));
        }
        Ok(())
    }

    // ========== 故障注入 ==========

    pub fn set_faults(&self, faults: BackendFaults) {
        self.lock().faults = faults;
    }

    pub fn faults(&self) -> BackendFaults {
        self.lock().faults.clone()
    }

    // ========== 装配与观察 ==========

    /// 直接以指定状态写入一个批次，跳过状态机（仅用于装配演示和测试数据）
    pub fn seed_batch(&self, config: &BatchConfig, status: BatchStatus) -> AppResult<Batch> {
        let metadata = config.validate()?;
        let now = Utc::now();
        let mut state = self.lock();
        let mut stored = new_stored_batch(&mut state, config, metadata);

        if matches!(
            status,
            BatchStatus::Staged
                | BatchStatus::Analyzing
                | BatchStatus::Paused
                | BatchStatus::Completed
                | BatchStatus::Failed
        ) {
            stored.assign_responses();
        }
        if status.is_active() {
            stored.running_since = Some(now);
        }
        stored.batch.status = status;

        let view = stored.view(now);
        state.batches.insert(view.id.clone(), stored);
        Ok(view)
    }

    pub fn batch_status(&self, id: &BatchId) -> Option<BatchStatus> {
        self.lock().batches.get(id).map(|b| b.batch.status)
    }

    pub fn archived(&self) -> Vec<ArchivedBatch> {
        self.lock().archive.clone()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().snapshots.keys().cloned().collect();
        names.sort();
        names
    }

    /// 尚未被回收的任务数
    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// 批次当前未结束的任务
    pub fn active_task(&self, id: &BatchId) -> Option<TaskId> {
        self.lock()
            .tasks
            .iter()
            .filter(|(_, t)| t.batch_id.as_ref() == Some(id) && !t.status.status.is_terminal())
            .map(|(task_id, _)| task_id.clone())
            .min()
    }

    // ========== 后台工作 ==========

    /// 系统事件：批次配置就绪
    pub fn mark_ready(&self, id: &BatchId) -> AppResult<BatchStatus> {
        self.lock().fire(id, LifecycleAction::MarkReady, Utc::now())
    }

    pub fn step_task(&self, task_id: &TaskId) -> AppResult<()> {
        self.lock().step_task(task_id, Utc::now())
    }

    pub fn complete_task(&self, task_id: &TaskId) -> AppResult<()> {
        self.lock().settle_task(task_id, Ok(()), Utc::now())
    }

    pub fn fail_task(&self, task_id: &TaskId, error: impl Into<String>) -> AppResult<()> {
        self.lock().settle_task(task_id, Err(error.into()), Utc::now())
    }

    /// 处理批次中下一条未完成的响应，返回其 ID；没有待处理响应时返回 `None`
    pub fn process_next_response(
        &self,
        id: &BatchId,
        outcome: ResponseStatus,
        score: Option<u8>,
    ) -> AppResult<Option<String>> {
        self.lock()
            .process_next_response(id, outcome, score, Utc::now())
    }

    /// 模拟一轮后台工作：每个未结束的任务前进一步，每个分析中的批次处理一条响应
    pub fn advance(&self) {
        let now = Utc::now();
        let mut state = self.lock();

        let mut pending: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, t)| !t.status.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        for task_id in pending {
            if let Err(e) = state.step_task(&task_id, now) {
                warn!("任务 {} 推进失败: {}", task_id, e);
            }
        }

        let analyzing: Vec<(BatchId, usize)> = state
            .batches
            .values()
            .filter(|b| b.batch.status == BatchStatus::Analyzing)
            .map(|b| {
                let processed = b.responses().filter(|r| r.status.is_finished()).count();
                (b.batch.id.clone(), processed)
            })
            .collect();
        for (id, processed) in analyzing {
            let (outcome, score) = simulated_outcome(processed);
            if let Err(e) = state.process_next_response(&id, outcome, score, now) {
                warn!("批次 {} 处理响应失败: {}", id, e);
            }
        }
    }
}

fn new_stored_batch(
    state: &mut BackendState,
    config: &BatchConfig,
    metadata: BTreeMap<String, JsonValue>,
) -> StoredBatch {
    state.next_batch += 1;
    let id = BatchId::new(format!("batch-{:04}", state.next_batch));

    let documents = config
        .documents
        .iter()
        .enumerate()
        .map(|(index, filename)| Document {
            id: format!("{}-doc-{}", id, index + 1),
            batch_id: id.clone(),
            filename: filename.clone(),
            responses: Vec::new(),
        })
        .collect();

    let or_default = |ids: &[String], fallback: &str| {
        if ids.is_empty() {
            vec![fallback.to_string()]
        } else {
            ids.to_vec()
        }
    };

    let mut batch = Batch::new(id, config.name.trim(), BatchStatus::Saved);
    batch.metadata = metadata;

    StoredBatch {
        batch,
        documents,
        prompt_ids: or_default(&config.prompt_ids, DEFAULT_PROMPT),
        connection_ids: or_default(&config.connection_ids, DEFAULT_CONNECTION),
        accumulated_secs: 0,
        running_since: None,
    }
}

#[async_trait]
impl BatchApi for MemoryBackend {
    async fn list_batches(&self, filter: &BatchFilter) -> AppResult<Vec<Batch>> {
        self.check_available()?;
        let now = Utc::now();
        let mut batches: Vec<Batch> = self
            .lock()
            .batches
            .values()
            .map(|stored| stored.view(now))
            .filter(|batch| filter.matches(batch))
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(batches)
    }

    async fn get_batch(&self, id: &BatchId) -> AppResult<Batch> {
        self.check_available()?;
        Ok(self.lock().stored(id)?.view(Utc::now()))
    }

    async fn create_batch(&self, config: &BatchConfig) -> AppResult<Batch> {
        self.check_available()?;
        let metadata = config.validate()?;
        let mut state = self.lock();
        let stored = new_stored_batch(&mut state, config, metadata);
        let view = stored.view(Utc::now());
        info!(
            "📦 创建批次 {} ({}), 文档 {} 个",
            view.id, view.name, view.document_counts.total
        );
        state.batches.insert(view.id.clone(), stored);
        Ok(view)
    }

    async fn delete_batch(&self, id: &BatchId, reason: &str) -> AppResult<()> {
        self.check_available()?;
        let _guard = self.in_flight.acquire(id)?;
        let now = Utc::now();
        let mut state = self.lock();
        let stored = state
            .batches
            .remove(id)
            .ok_or_else(|| AppError::not_found(id.as_str()))?;

        info!("🗄️ 归档并删除批次 {}: {}", id, reason);
        state.archive.push(ArchivedBatch {
            batch: stored.view(now),
            documents: stored.documents,
            reason: reason.to_string(),
            archived_at: now,
        });
        Ok(())
    }

    async fn perform(&self, id: &BatchId, action: LifecycleAction) -> AppResult<ActionOutcome> {
        self.check_available()?;
        if !action.is_user_action() {
            return Err(ValidationError::Rejected {
                message: format!("{} 是系统事件，不能由客户端触发", action),
            }
            .into());
        }

        let _guard = self.in_flight.acquire(id)?;
        let latency = self.lock().faults.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let now = Utc::now();
        let mut state = self.lock();
        let faults = state.faults.clone();
        let transition = {
            let stored = state.stored_mut(id)?;
            let transition = lifecycle::transition(id, stored.batch.status, action)?;

            if faults.drop_task_ids && action.task_kind().is_some() {
                warn!("⚠️ 批次 {} 的 {} 未启动任务", id, action);
                return Ok(ActionOutcome::Task(TaskHandle::new(
                    action.task_kind().unwrap_or(TaskKind::Stage),
                    None,
                )));
            }
            if faults.stall_transitions {
                debug!("搁置批次 {} 的 {}", id, action);
                return Ok(ActionOutcome::Accepted);
            }

            stored.apply(&transition, now);
            transition
        };
        info!(
            "🔄 批次 {}: {} → {} ({})",
            id, transition.from, transition.to, action
        );

        match action.task_kind() {
            Some(kind) => {
                let task_id = state.spawn_task(kind, Some(id.clone()), Some(action), JsonValue::Null)?;
                Ok(ActionOutcome::Task(TaskHandle::new(kind, Some(task_id))))
            }
            None => Ok(ActionOutcome::Status(transition.to)),
        }
    }

    async fn start_task(&self, kind: TaskKind, params: JsonValue) -> AppResult<TaskHandle> {
        self.check_available()?;
        if !kind.is_maintenance() {
            return Err(ValidationError::Rejected {
                message: format!("{} 任务必须通过批次动作启动", kind),
            }
            .into());
        }

        let mut state = self.lock();
        if state.faults.drop_task_ids {
            return Ok(TaskHandle::new(kind, None));
        }
        let task_id = state.spawn_task(kind, None, None, params)?;
        info!("🛠️ 启动维护任务 {} ({})", task_id, kind);
        Ok(TaskHandle::new(kind, Some(task_id)))
    }

    async fn get_task_status(&self, task_id: &TaskId) -> AppResult<TaskStatus> {
        self.check_available()?;
        let mut state = self.lock();
        let status = state
            .tasks
            .get(task_id)
            .map(|task| task.status.clone())
            .ok_or_else(|| AppError::invalid_task(task_id.as_str()))?;

        if status.status.is_terminal() {
            state.tasks.remove(task_id);
            debug!("回收已结束的任务 {}", task_id);
        }
        Ok(status)
    }

    async fn list_responses(
        &self,
        id: &BatchId,
        query: &ResponseQuery,
    ) -> AppResult<Page<Response>> {
        self.check_available()?;
        if query.limit == 0 || query.limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::InvalidQuery {
                reason: format!("limit 必须在 1..={} 之间", MAX_PAGE_LIMIT),
            }
            .into());
        }

        let state = self.lock();
        let matching: Vec<&Response> = state
            .stored(id)?
            .responses()
            .filter(|r| query.matches(r))
            .collect();

        Ok(Page {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .cloned()
                .collect(),
            offset: query.offset,
            limit: query.limit,
        })
    }

    async fn get_dashboard(&self, selection: &SelectionContext) -> AppResult<DashboardSnapshot> {
        let batches = self.list_batches(&BatchFilter::default()).await?;
        Ok(aggregation::build_dashboard(
            &batches,
            selection,
            self.recent_limit,
            Utc::now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AggregationMode;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn config(name: &str) -> BatchConfig {
        BatchConfig {
            name: name.into(),
            documents: vec!["a.pdf".into(), "b.pdf".into()],
            prompt_ids: vec!["p1".into()],
            connection_ids: vec!["c1".into(), "c2".into()],
            ..Default::default()
        }
    }

    fn started(outcome: ActionOutcome) -> TaskId {
        match outcome {
            ActionOutcome::Task(TaskHandle {
                task_id: Some(task_id),
                ..
            }) => task_id,
            other => panic!("expected a started task, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let backend = MemoryBackend::new(10);
        let batch = backend.create_batch(&config("alpha")).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Saved);
        assert_eq!(batch.document_counts.total, 2);
        assert_eq!(batch.response_counts.total, 0);

        let stage = started(backend.stage(&batch.id).await.unwrap());
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Staging));
        assert_ok!(backend.complete_task(&stage));
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Staged));

        let staged = backend.get_batch(&batch.id).await.unwrap();
        assert_eq!(staged.response_counts, ResponseCounts::new(0, 0, 0, 4));

        let analysis = started(backend.run_analysis(&batch.id).await.unwrap());
        for _ in 0..3 {
            backend
                .process_next_response(&batch.id, ResponseStatus::Succeeded, Some(80))
                .unwrap();
        }
        backend
            .process_next_response(&batch.id, ResponseStatus::Failed, None)
            .unwrap();
        // 分析任务尚未结束
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Analyzing));

        assert_ok!(backend.complete_task(&analysis));
        let done = backend.get_batch(&batch.id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.response_counts, ResponseCounts::new(3, 1, 0, 0));
        assert_eq!(done.document_counts, DocumentCounts::new(2, 0, 0, 0));
        assert!(done.counts_consistent());
    }

    #[tokio::test]
    async fn test_invalid_transition_is_a_state_conflict() {
        let backend = MemoryBackend::new(10);
        let batch = backend.create_batch(&config("alpha")).await.unwrap();

        let result = backend.pause(&batch.id).await;
        assert!(matches!(result, Err(ref e) if e.is_state_conflict()));
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Saved));

        let system_event = backend
            .perform(&batch.id, LifecycleAction::StagingSucceeded)
            .await;
        assert!(matches!(system_event, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_terminal_task_is_collected_after_one_read() {
        let backend = MemoryBackend::new(10);
        let batch = backend.create_batch(&config("alpha")).await.unwrap();
        let task_id = started(backend.stage(&batch.id).await.unwrap());

        let status = backend.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskState::Queued);

        backend.step_task(&task_id).unwrap();
        let status = backend.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskState::Running);
        assert_eq!(status.progress_label(), "步骤 1/5 (20%)");

        backend.fail_task(&task_id, "disk full").unwrap();
        let status = backend.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskState::Error);
        assert_eq!(status.error.as_deref(), Some("disk full"));
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::FailedStaging));

        let gone = backend.get_task_status(&task_id).await;
        assert!(matches!(gone, Err(ref e) if e.is_invalid_task()));
        assert_eq!(backend.task_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_archives_with_reason() {
        let backend = MemoryBackend::new(10);
        let batch = backend.create_batch(&config("alpha")).await.unwrap();

        assert_ok!(backend.delete_batch(&batch.id, "duplicate upload").await);
        let archived = backend.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].reason, "duplicate upload");
        assert_eq!(archived[0].documents.len(), 2);

        assert!(matches!(
            backend.get_batch(&batch.id).await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_task_id_leaves_batch_untouched() {
        let backend = MemoryBackend::new(10);
        let batch = backend.create_batch(&config("alpha")).await.unwrap();
        backend.set_faults(BackendFaults {
            drop_task_ids: true,
            ..Default::default()
        });

        match backend.stage(&batch.id).await.unwrap() {
            ActionOutcome::Task(handle) => assert!(!handle.is_started()),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Saved));
        assert_eq!(backend.task_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_backend_returns_transient_errors() {
        let backend = MemoryBackend::new(10);
        backend.set_faults(BackendFaults {
            unavailable: true,
            ..Default::default()
        });
        let result = backend.list_batches(&BatchFilter::default()).await;
        assert!(matches!(result, Err(ref e) if e.is_transient()));
    }

    #[tokio::test]
    async fn test_response_pagination_and_filters() {
        let backend = MemoryBackend::new(10);
        let batch = backend.seed_batch(&config("alpha"), BatchStatus::Analyzing).unwrap();
        backend
            .process_next_response(&batch.id, ResponseStatus::Succeeded, Some(90))
            .unwrap();
        backend
            .process_next_response(&batch.id, ResponseStatus::Succeeded, Some(30))
            .unwrap();

        let page = backend
            .list_responses(
                &batch.id,
                &ResponseQuery {
                    offset: 1,
                    limit: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 2);

        let high = backend
            .list_responses(
                &batch.id,
                &ResponseQuery {
                    min_score: Some(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(high.total, 1);
        assert_eq!(high.items[0].suitability_score, Some(90));

        let invalid = backend
            .list_responses(
                &batch.id,
                &ResponseQuery {
                    limit: 0,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(
            invalid,
            Err(AppError::Validation(ValidationError::InvalidQuery { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_state_changes_on_one_batch_conflict() {
        let backend = Arc::new(MemoryBackend::new(10));
        let batch = backend.seed_batch(&config("alpha"), BatchStatus::Analyzing).unwrap();
        backend.set_faults(BackendFaults {
            latency: Duration::from_millis(500),
            ..Default::default()
        });

        let (first, second) = tokio::join!(backend.pause(&batch.id), backend.pause(&batch.id));
        assert_eq!(first.unwrap(), ActionOutcome::Status(BatchStatus::Paused));
        assert!(matches!(
            second,
            Err(AppError::StateConflict(StateConflict::InFlight { .. }))
        ));
        // 占用已释放
        assert_ok!(backend.resume(&batch.id).await);
    }

    #[tokio::test]
    async fn test_reset_to_prestage_unassigns_and_clears_progress() {
        let backend = MemoryBackend::new(10);
        let batch = backend.seed_batch(&config("alpha"), BatchStatus::Analyzing).unwrap();
        backend
            .process_next_response(&batch.id, ResponseStatus::Succeeded, Some(70))
            .unwrap();

        assert_eq!(
            backend.reset_to_prestage(&batch.id).await.unwrap(),
            ActionOutcome::Status(BatchStatus::Saved)
        );
        let reset = backend.get_batch(&batch.id).await.unwrap();
        assert_eq!(reset.response_counts.total, 0);
        assert_eq!(reset.elapsed_seconds, 0);
        assert_eq!(reset.document_counts, DocumentCounts::new(0, 0, 0, 2));
    }

    #[tokio::test]
    async fn test_rerun_clears_previous_responses() {
        let backend = MemoryBackend::new(10);
        let batch = backend.seed_batch(&config("alpha"), BatchStatus::Analyzing).unwrap();
        for _ in 0..4 {
            backend
                .process_next_response(&batch.id, ResponseStatus::Succeeded, Some(70))
                .unwrap();
        }
        // 没有分析任务在跑，最后一条处理完即完成
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Completed));

        let _task = started(backend.rerun(&batch.id).await.unwrap());
        let rerun = backend.get_batch(&batch.id).await.unwrap();
        assert_eq!(rerun.status, BatchStatus::Analyzing);
        assert_eq!(rerun.response_counts, ResponseCounts::new(0, 0, 0, 4));
    }

    #[tokio::test]
    async fn test_restage_and_rerun_runs_analysis_after_staging() {
        let backend = MemoryBackend::new(10);
        let batch = backend.seed_batch(&config("alpha"), BatchStatus::Completed).unwrap();

        let stage_task = started(backend.restage_and_rerun(&batch.id).await.unwrap());
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Staging));

        for _ in 0..TASK_STEPS {
            backend.advance();
        }
        // 暂存完成后自动进入分析，不需要再手动 run_analysis
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Analyzing));
        let analysis_task = backend.active_task(&batch.id).expect("应该有重跑的分析任务");
        assert_ne!(analysis_task, stage_task);

        for _ in 0..TASK_STEPS {
            backend.advance();
        }
        let done = backend.get_batch(&batch.id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.response_counts.finished(), 4);
    }

    #[tokio::test]
    async fn test_plain_stage_stops_at_staged() {
        let backend = MemoryBackend::new(10);
        let batch = backend.create_batch(&config("alpha")).await.unwrap();
        started(backend.stage(&batch.id).await.unwrap());

        for _ in 0..TASK_STEPS * 2 {
            backend.advance();
        }
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Staged));
        assert_eq!(backend.active_task(&batch.id), None);
    }

    #[tokio::test]
    async fn test_snapshot_and_reset_database_tasks() {
        let backend = MemoryBackend::new(10);
        backend.create_batch(&config("alpha")).await.unwrap();

        let snapshot = backend
            .start_task(TaskKind::CreateSnapshot, json!({"name": "nightly"}))
            .await
            .unwrap();
        let snapshot_id = snapshot.task_id.clone().unwrap();
        backend.complete_task(&snapshot_id).unwrap();
        assert_eq!(backend.snapshot_names(), vec!["nightly".to_string()]);

        let reset = backend
            .start_task(TaskKind::ResetDatabase, JsonValue::Null)
            .await
            .unwrap();
        backend.complete_task(reset.task_id.as_ref().unwrap()).unwrap();
        assert!(backend.list_batches(&BatchFilter::default()).await.unwrap().is_empty());

        let restore = backend
            .start_task(TaskKind::RestoreSnapshot, json!({"name": "nightly"}))
            .await
            .unwrap();
        backend.complete_task(restore.task_id.as_ref().unwrap()).unwrap();
        assert_eq!(backend.list_batches(&BatchFilter::default()).await.unwrap().len(), 1);

        let missing = backend
            .start_task(TaskKind::RestoreSnapshot, json!({"name": "weekly"}))
            .await
            .unwrap();
        let missing_id = missing.task_id.unwrap();
        backend.complete_task(&missing_id).unwrap();
        let status = backend.get_task_status(&missing_id).await.unwrap();
        assert_eq!(status.status, TaskState::Error);

        assert_err!(backend.start_task(TaskKind::Stage, JsonValue::Null).await);
    }

    #[tokio::test]
    async fn test_advance_drives_batches_to_completion() {
        let backend = MemoryBackend::new(10);
        let batch = backend.create_batch(&config("alpha")).await.unwrap();
        started(backend.stage(&batch.id).await.unwrap());

        for _ in 0..TASK_STEPS {
            backend.advance();
        }
        assert_eq!(backend.batch_status(&batch.id), Some(BatchStatus::Staged));

        started(backend.run_analysis(&batch.id).await.unwrap());
        for _ in 0..TASK_STEPS {
            backend.advance();
        }
        let done = backend.get_batch(&batch.id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.response_counts.finished(), 4);
    }

    #[tokio::test]
    async fn test_server_side_dashboard() {
        let backend = MemoryBackend::new(10);
        backend.seed_batch(&config("a"), BatchStatus::Analyzing).unwrap();
        backend.seed_batch(&config("b"), BatchStatus::Completed).unwrap();
        let c = backend.seed_batch(&config("c"), BatchStatus::Completed).unwrap();

        let snapshot = backend.get_dashboard(&SelectionContext::empty()).await.unwrap();
        assert_eq!(snapshot.summary_stats.mode, AggregationMode::ActiveOnly);
        assert_eq!(snapshot.summary_stats.total_batches, 1);
        assert_eq!(snapshot.recent_batches.len(), 3);

        let filtered = backend
            .get_dashboard(&SelectionContext::new([c.id.clone()]))
            .await
            .unwrap();
        assert_eq!(filtered.summary_stats.mode, AggregationMode::Filtered);
        assert_eq!(filtered.summary_stats.total_batches, 1);
    }
}

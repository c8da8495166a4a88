//! 批次服务接口
//!
//! 核心只通过这一个窄接口与外部协作方交互：批次 CRUD、生命周期动作、
//! 任务状态、响应分页查询和仪表盘快照。HTTP 客户端和内存服务端都实现它。

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::AppResult;
use crate::lifecycle::LifecycleAction;
use crate::models::{
    ActionOutcome, Batch, BatchConfig, BatchFilter, BatchId, DashboardSnapshot, Page, Response,
    ResponseQuery, SelectionContext, TaskHandle, TaskId, TaskKind, TaskStatus,
};

#[async_trait]
pub trait BatchApi: Send + Sync {
    // ---- 批次 CRUD ----

    async fn list_batches(&self, filter: &BatchFilter) -> AppResult<Vec<Batch>>;

    async fn get_batch(&self, id: &BatchId) -> AppResult<Batch>;

    async fn create_batch(&self, config: &BatchConfig) -> AppResult<Batch>;

    /// 先归档批次及其子数据，再删除
    async fn delete_batch(&self, id: &BatchId, reason: &str) -> AppResult<()>;

    // ---- 生命周期动作 ----

    /// 执行一个用户动作，返回同步状态或任务句柄
    async fn perform(&self, id: &BatchId, action: LifecycleAction) -> AppResult<ActionOutcome>;

    // ---- 任务 ----

    /// 启动不绑定批次的维护任务（重置数据库、创建/恢复快照）
    async fn start_task(&self, kind: TaskKind, params: JsonValue) -> AppResult<TaskHandle>;

    /// 单次查询任务状态；未知 ID 返回 `InvalidTask`
    async fn get_task_status(&self, task_id: &TaskId) -> AppResult<TaskStatus>;

    // ---- 查询 ----

    async fn list_responses(&self, id: &BatchId, query: &ResponseQuery)
        -> AppResult<Page<Response>>;

    async fn get_dashboard(&self, selection: &SelectionContext) -> AppResult<DashboardSnapshot>;

    // ---- 具名动作 ----

    async fn stage(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Stage).await
    }

    async fn run_analysis(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::RunAnalysis).await
    }

    async fn pause(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Pause).await
    }

    async fn resume(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Resume).await
    }

    async fn rerun(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::Rerun).await
    }

    async fn restage_and_rerun(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::RestageAndRerun).await
    }

    async fn reset_to_prestage(&self, id: &BatchId) -> AppResult<ActionOutcome> {
        self.perform(id, LifecycleAction::ResetToPrestage).await
    }
}

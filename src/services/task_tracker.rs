//! 任务追踪 - 业务能力层
//!
//! ## 职责
//!
//! - `start` 发起长耗时操作，拿到任务句柄
//! - `track` 为句柄开启轮询会话，进度通过事件通道推送给观察者
//! - `cancel` 只停止客户端轮询，不保证服务端停止执行
//!
//! ## 轮询纪律
//!
//! 1. 每个逻辑操作（[`TrackKey`]）同一时刻只有一个轮询会话；重新 `track` 会先取消旧会话
//! 2. 收到终态（completed / error）的那一轮立即停止，不多发请求
//! 3. 瞬时错误只记日志、继续轮询；确认任务不存在则停止并推送 `Invalid`
//! 4. 每个会话带代数（generation），旧会话残留在通道里的事件由消费方丢弃

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::error::{AppError, AppResult};
use crate::models::{BatchId, TaskHandle, TaskId, TaskKind, TaskStatus};
use crate::services::api::BatchApi;

/// 逻辑操作标识：任务类型 + 所属批次（维护任务没有批次）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub kind: TaskKind,
    pub batch_id: Option<BatchId>,
}

impl TrackKey {
    pub fn for_batch(kind: TaskKind, batch_id: &BatchId) -> Self {
        Self {
            kind,
            batch_id: Some(batch_id.clone()),
        }
    }

    pub fn maintenance(kind: TaskKind) -> Self {
        Self {
            kind,
            batch_id: None,
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.batch_id {
            Some(id) => write!(f, "{}@{}", self.kind, id),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// 一次轮询产生的更新
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// 仍在进行
    Progress(TaskStatus),
    /// 终态（completed 或 error）
    Finished(TaskStatus),
    /// 任务 ID 已失效
    Invalid,
}

/// 推送给观察者的任务事件
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub key: TrackKey,
    pub generation: u64,
    pub task_id: TaskId,
    pub update: TaskUpdate,
}

/// 单个任务的轮询会话
///
/// 持有唯一的定时循环；`cancel()` 或 drop 都会确定性地停止它
#[derive(Debug)]
pub struct PollingSession {
    task_id: TaskId,
    generation: u64,
    handle: JoinHandle<()>,
}

impl PollingSession {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 任务追踪器（每个观察者会话一个）
pub struct TaskTracker {
    api: Arc<dyn BatchApi>,
    polling: PollingConfig,
    sessions: Mutex<HashMap<TrackKey, PollingSession>>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskTracker {
    /// 创建追踪器，同时返回事件接收端
    pub fn new(
        api: Arc<dyn BatchApi>,
        polling: PollingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let tracker = Self {
            api,
            polling,
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events,
        };
        (tracker, receiver)
    }

    /// 发起维护类任务
    pub async fn start(&self, kind: TaskKind, params: JsonValue) -> AppResult<TaskHandle> {
        info!("🚀 发起任务: {}", kind);
        self.api.start_task(kind, params).await
    }

    /// 单次查询
    pub async fn poll(&self, task_id: &TaskId) -> AppResult<TaskStatus> {
        self.api.get_task_status(task_id).await
    }

    /// 为任务句柄开启轮询
    ///
    /// 句柄没有有效 ID 时返回 `NoTask`，不会发出任何轮询请求。
    /// 同一 `key` 已有会话时先取消旧会话。返回新会话的代数。
    pub fn track(&self, key: TrackKey, handle: &TaskHandle) -> AppResult<u64> {
        let Some(task_id) = handle.task_id.clone() else {
            warn!("⚠️ {} 没有返回有效的任务 ID，不开始轮询", key);
            return Err(AppError::NoTask { kind: handle.kind });
        };

        let period = self.polling.interval_for(handle.kind);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut sessions = self.lock_sessions();
        if let Some(previous) = sessions.remove(&key) {
            debug!(
                "取消 {} 的旧轮询会话 (任务 {}, 代数 {})",
                key, previous.task_id, previous.generation
            );
            previous.cancel();
        }

        let handle = tokio::spawn(poll_loop(
            self.api.clone(),
            key.clone(),
            generation,
            task_id.clone(),
            period,
            self.events.clone(),
        ));

        info!(
            "📡 开始轮询 {} (任务 {}, 间隔 {:?})",
            key, task_id, period
        );
        sessions.insert(
            key,
            PollingSession {
                task_id,
                generation,
                handle,
            },
        );

        Ok(generation)
    }

    /// 停止某个逻辑操作的轮询
    pub fn cancel(&self, key: &TrackKey) -> bool {
        match self.lock_sessions().remove(key) {
            Some(session) => {
                session.cancel();
                debug!("已取消 {} 的轮询", key);
                true
            }
            None => false,
        }
    }

    /// 按任务 ID 停止轮询；只停止客户端的观察，不取消服务端的工作
    pub fn cancel_task(&self, task_id: &TaskId) -> bool {
        let mut sessions = self.lock_sessions();
        let keys: Vec<TrackKey> = sessions
            .iter()
            .filter(|(_, session)| &session.task_id == task_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(session) = sessions.remove(key) {
                session.cancel();
                debug!("已取消任务 {} 的轮询 ({})", task_id, key);
            }
        }
        !keys.is_empty()
    }

    /// 停止全部轮询（观察者销毁时调用）
    pub fn cancel_all(&self) {
        let mut sessions = self.lock_sessions();
        for (_, session) in sessions.drain() {
            session.cancel();
        }
    }

    /// 会话已到达终态后移除；`generation` 不是当前会话时不做任何事
    pub fn retire(&self, key: &TrackKey, generation: u64) -> bool {
        let mut sessions = self.lock_sessions();
        match sessions.get(key) {
            Some(session) if session.generation == generation => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    /// 事件是否来自该 key 当前的会话
    pub fn is_current(&self, key: &TrackKey, generation: u64) -> bool {
        self.lock_sessions()
            .get(key)
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    /// 正在运行的轮询会话数
    pub fn active_sessions(&self) -> usize {
        self.lock_sessions().values().filter(|s| s.is_active()).count()
    }

    pub fn is_tracking(&self, key: &TrackKey) -> bool {
        self.lock_sessions()
            .get(key)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<TrackKey, PollingSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// 轮询循环
///
/// 每轮先等待上一次请求完成再进入下一轮，同一会话内的结果天然按发出顺序处理
async fn poll_loop(
    api: Arc<dyn BatchApi>,
    key: TrackKey,
    generation: u64,
    task_id: TaskId,
    period: Duration,
    events: mpsc::UnboundedSender<TaskEvent>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let update = match api.get_task_status(&task_id).await {
            Ok(status) if status.status.is_terminal() => TaskUpdate::Finished(status),
            Ok(status) => TaskUpdate::Progress(status),
            Err(e) if e.is_invalid_task() => {
                warn!("⚠️ {} 的任务 {} 已失效，停止轮询", key, task_id);
                TaskUpdate::Invalid
            }
            Err(e) => {
                // 瞬时错误不逐轮上报
                warn!("轮询 {} 失败，下一轮重试: {}", key, e);
                continue;
            }
        };

        let stop = !matches!(update, TaskUpdate::Progress(_));
        let event = TaskEvent {
            key: key.clone(),
            generation,
            task_id: task_id.clone(),
            update,
        };

        if events.send(event).is_err() {
            debug!("{} 的事件接收端已关闭，停止轮询", key);
            break;
        }
        if stop {
            debug!("{} 已到达终态，停止轮询", key);
            break;
        }
    }
}

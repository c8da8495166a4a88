use async_trait::async_trait;
use batch_monitor::clients::HttpBatchClient;
use batch_monitor::config::Config;
use batch_monitor::error::{AppError, AppResult, ValidationError};
use batch_monitor::lifecycle::LifecycleAction;
use batch_monitor::models::{
    ActionOutcome, AggregationMode, Batch, BatchConfig, BatchFilter, BatchId, BatchStatus,
    DashboardSnapshot, Page, Response, ResponseQuery, SelectionContext, TaskHandle, TaskId,
    TaskKind, TaskStatus,
};
use batch_monitor::services::{BackendFaults, BatchApi, MemoryBackend, ReconcileOutcome, TrackKey};
use batch_monitor::utils::logging;
use batch_monitor::workflow::{Confirmation, NoticeLevel, ViewerSession, ViewerSettings};
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

fn batch_config(name: &str) -> BatchConfig {
    BatchConfig {
        name: name.into(),
        documents: vec!["a.pdf".into(), "b.pdf".into()],
        prompt_ids: vec!["p1".into()],
        connection_ids: vec!["c1".into()],
        ..Default::default()
    }
}

fn viewer_for(backend: &Arc<MemoryBackend>) -> ViewerSession {
    ViewerSession::new(backend.clone(), ViewerSettings::default())
}

fn seed(backend: &MemoryBackend, name: &str, status: BatchStatus) -> BatchId {
    backend
        .seed_batch(&batch_config(name), status)
        .expect("写入测试批次失败")
        .id
}

fn task_id_of(outcome: &ActionOutcome) -> TaskId {
    match outcome {
        ActionOutcome::Task(TaskHandle {
            task_id: Some(task_id),
            ..
        }) => task_id.clone(),
        other => panic!("应该返回已启动的任务，实际是 {:?}", other),
    }
}

async fn has_notice(viewer: &ViewerSession, needle: &str) -> bool {
    viewer
        .notices()
        .await
        .iter()
        .any(|notice| notice.message.contains(needle))
}

/// 列表接口先取数据、再按设定延迟返回，模拟迟到的旧响应
struct SlowListing {
    inner: Arc<MemoryBackend>,
    next_delay: Mutex<Option<Duration>>,
}

impl SlowListing {
    fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            next_delay: Mutex::new(None),
        }
    }

    fn delay_next(&self, delay: Duration) {
        *self.next_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl BatchApi for SlowListing {
    async fn list_batches(&self, filter: &BatchFilter) -> AppResult<Vec<Batch>> {
        let batches = self.inner.list_batches(filter).await?;
        let delay = self.next_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        Ok(batches)
    }

    async fn get_batch(&self, id: &BatchId) -> AppResult<Batch> {
        self.inner.get_batch(id).await
    }

    async fn create_batch(&self, config: &BatchConfig) -> AppResult<Batch> {
        self.inner.create_batch(config).await
    }

    async fn delete_batch(&self, id: &BatchId, reason: &str) -> AppResult<()> {
        self.inner.delete_batch(id, reason).await
    }

    async fn perform(&self, id: &BatchId, action: LifecycleAction) -> AppResult<ActionOutcome> {
        self.inner.perform(id, action).await
    }

    async fn start_task(&self, kind: TaskKind, params: JsonValue) -> AppResult<TaskHandle> {
        self.inner.start_task(kind, params).await
    }

    async fn get_task_status(&self, task_id: &TaskId) -> AppResult<TaskStatus> {
        self.inner.get_task_status(task_id).await
    }

    async fn list_responses(&self, id: &BatchId, query: &ResponseQuery) -> AppResult<Page<Response>> {
        self.inner.list_responses(id, query).await
    }

    async fn get_dashboard(&self, selection: &SelectionContext) -> AppResult<DashboardSnapshot> {
        self.inner.get_dashboard(selection).await
    }
}

// ========== 乐观更新与对账 ==========

#[tokio::test(start_paused = true)]
async fn test_pause_is_optimistic_then_confirmed() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    // 发出暂停：本地立即变成 Paused
    let outcome = viewer.pause(&id).await.expect("暂停失败");
    assert_eq!(outcome, ActionOutcome::Status(BatchStatus::Paused));
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Paused);
    assert!(viewer.has_pending(&id).await, "确认前应保留期望");

    // 延迟刷新到达后期望被确认
    sleep(Duration::from_millis(6_100)).await;
    assert!(!viewer.has_pending(&id).await, "延迟刷新后期望应被清除");
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Paused);
}

#[tokio::test(start_paused = true)]
async fn test_late_refresh_does_not_overwrite_newer_data() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    let api = Arc::new(SlowListing::new(backend.clone()));
    let viewer = ViewerSession::new(api.clone(), ViewerSettings::default());
    assert_ok!(viewer.refresh().await);

    // 第一次刷新在暂停前拿到 Analyzing，2 秒后才返回
    api.delay_next(Duration::from_secs(2));
    let (late, fresh) = tokio::join!(viewer.refresh(), async {
        sleep(Duration::from_millis(100)).await;
        viewer.pause(&id).await.expect("暂停失败");
        viewer.refresh().await.expect("刷新失败")
    });

    assert_eq!(fresh.outcome(&id), Some(ReconcileOutcome::Confirmed));
    let late = late.expect("刷新失败");
    assert!(late.stale, "晚到的旧结果应被丢弃");
    assert_eq!(late.outcome(&id), None);

    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Paused);
    assert_eq!(backend.batch_status(&id), Some(BatchStatus::Paused));
}

#[tokio::test(start_paused = true)]
async fn test_failed_resume_keeps_earlier_pause() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    assert_ok!(viewer.pause(&id).await);

    // 恢复请求失败：只撤销恢复本身，暂停仍然有效
    backend.set_faults(BackendFaults {
        unavailable: true,
        ..Default::default()
    });
    let err = assert_err!(viewer.resume(&id).await);
    assert!(err.is_transient());
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Paused);
    assert!(viewer.has_pending(&id).await, "暂停的期望应该保留");

    // 服务端恢复后，暂停的延迟刷新照常确认
    backend.set_faults(BackendFaults::default());
    sleep(Duration::from_millis(6_100)).await;
    assert!(!viewer.has_pending(&id).await);
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Paused);
    assert_eq!(backend.batch_status(&id), Some(BatchStatus::Paused));
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_transition_expires_after_ttl() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    // 服务端受理请求但从不执行转换
    backend.set_faults(BackendFaults {
        stall_transitions: true,
        ..Default::default()
    });
    let outcome = viewer.pause(&id).await.expect("暂停失败");
    assert_eq!(outcome, ActionOutcome::Accepted);

    // 6 秒后的延迟刷新：服务端仍是 Analyzing，保留乐观值
    sleep(Duration::from_millis(6_100)).await;
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Paused);
    assert!(viewer.has_pending(&id).await);

    // 超过 TTL 后回到服务端的真实状态
    sleep(Duration::from_secs(4)).await;
    let report = viewer.refresh().await.expect("刷新失败");
    assert_eq!(report.outcome(&id), Some(ReconcileOutcome::Expired));
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Analyzing);
    assert!(!viewer.has_pending(&id).await);
    assert!(has_notice(&viewer, "未被服务端确认").await);
}

#[tokio::test(start_paused = true)]
async fn test_other_viewers_see_authoritative_changes() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    let first = viewer_for(&backend);
    let second = viewer_for(&backend);
    assert_ok!(first.refresh().await);
    assert_ok!(second.refresh().await);

    assert_ok!(first.pause(&id).await);

    // 第二个观察者没有期望，直接采用服务端数据
    let report = second.refresh().await.expect("刷新失败");
    assert_eq!(report.outcome(&id), Some(ReconcileOutcome::Adopted));
    assert_eq!(second.batch(&id).await.unwrap().status, BatchStatus::Paused);
    assert!(!second.has_pending(&id).await);
}

// ========== 预检与确认 ==========

#[tokio::test]
async fn test_invalid_action_fails_before_any_request() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Saved);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    // 服务端不可用：如果真的发出请求会得到网络错误
    backend.set_faults(BackendFaults {
        unavailable: true,
        ..Default::default()
    });

    let result = viewer.pause(&id).await;
    assert!(matches!(result, Err(ref e) if e.is_state_conflict()), "{:?}", result);
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Saved);
    assert!(!viewer.has_pending(&id).await);
    assert!(viewer.notices().await.is_empty(), "预检失败不产生通知");
}

#[tokio::test]
async fn test_available_actions_follow_local_status() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    let actions = viewer.available_actions(&id).await;
    assert!(actions.contains(&LifecycleAction::Pause));
    assert!(!actions.contains(&LifecycleAction::Resume));

    assert_ok!(viewer.pause(&id).await);
    let actions = viewer.available_actions(&id).await;
    assert!(actions.contains(&LifecycleAction::Resume));
    assert!(viewer.available_actions(&BatchId::new("missing")).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_actions_on_one_batch_conflict() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    backend.set_faults(BackendFaults {
        latency: Duration::from_secs(1),
        ..Default::default()
    });
    let viewer = viewer_for(&backend);

    let (first, second) = tokio::join!(viewer.pause(&id), viewer.pause(&id));
    assert_ok!(first);
    let err = assert_err!(second);
    assert!(err.is_state_conflict());
    assert_eq!(backend.batch_status(&id), Some(BatchStatus::Paused));
}

#[tokio::test]
async fn test_destructive_actions_require_confirmation() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    // 未确认：不发请求
    let declined = viewer.reset_to_prestage(&id, Confirmation::Declined).await;
    assert!(matches!(
        declined,
        Err(AppError::Validation(ValidationError::ConfirmationRequired { .. }))
    ));
    let generic = viewer.perform(&id, LifecycleAction::ResetToPrestage).await;
    assert!(matches!(
        generic,
        Err(AppError::Validation(ValidationError::ConfirmationRequired { .. }))
    ));
    let delete = viewer.delete_batch(&id, "cleanup", Confirmation::Declined).await;
    assert!(matches!(
        delete,
        Err(AppError::Validation(ValidationError::ConfirmationRequired { .. }))
    ));
    assert_eq!(backend.batch_status(&id), Some(BatchStatus::Analyzing));
    assert!(backend.archived().is_empty());

    // 确认后执行
    let outcome = viewer
        .reset_to_prestage(&id, Confirmation::Confirmed)
        .await
        .expect("重置失败");
    assert_eq!(outcome, ActionOutcome::Status(BatchStatus::Saved));
    assert_eq!(backend.batch_status(&id), Some(BatchStatus::Saved));

    assert_ok!(viewer.delete_batch(&id, "cleanup", Confirmation::Confirmed).await);
    assert!(viewer.batch(&id).await.is_none());
    let archived = backend.archived();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].reason, "cleanup");
}

#[tokio::test]
async fn test_invalid_batch_config_is_rejected_locally() {
    let backend = Arc::new(MemoryBackend::new(10));
    let viewer = viewer_for(&backend);

    let config = BatchConfig {
        metadata: Some("{not json".into()),
        ..batch_config("alpha")
    };
    let result = viewer.create_batch(&config).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(viewer.batches().await.is_empty());
}

// ========== 任务追踪 ==========

#[tokio::test]
async fn test_missing_task_id_rolls_back() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Saved);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    backend.set_faults(BackendFaults {
        drop_task_ids: true,
        ..Default::default()
    });

    let result = viewer.stage(&id).await;
    assert!(
        matches!(result, Err(AppError::NoTask { kind: TaskKind::Stage })),
        "{:?}",
        result
    );
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Saved);
    assert!(!viewer.has_pending(&id).await);
    assert_eq!(viewer.tracker().active_sessions(), 0, "不应开始轮询");
    assert!(has_notice(&viewer, "没有有效的任务").await);
    assert_eq!(backend.batch_status(&id), Some(BatchStatus::Saved));
}

#[tokio::test(start_paused = true)]
async fn test_stage_is_tracked_to_completion() {
    let backend = Arc::new(MemoryBackend::new(10));
    let viewer = viewer_for(&backend);
    let batch = viewer
        .create_batch(&batch_config("alpha"))
        .await
        .expect("创建批次失败");
    let id = batch.id;

    let outcome = viewer.stage(&id).await.expect("暂存失败");
    let task_id = task_id_of(&outcome);
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Staging);
    assert!(viewer.is_processing(&id).await);
    assert_eq!(viewer.task_views().await.len(), 1);
    assert!(viewer
        .tracker()
        .is_tracking(&TrackKey::for_batch(TaskKind::Stage, &id)));

    // 服务端完成任务，下一轮轮询观察到终态
    assert_ok!(backend.complete_task(&task_id));
    sleep(Duration::from_millis(1_500)).await;

    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Staged);
    assert!(!viewer.is_processing(&id).await);
    assert!(!viewer.has_pending(&id).await);
    assert_eq!(viewer.tracker().active_sessions(), 0);
    assert_eq!(backend.task_count(), 0, "终态读取后任务应被回收");
    assert!(has_notice(&viewer, "已完成").await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_surfaces_server_detail() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Saved);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    let task_id = task_id_of(&viewer.stage(&id).await.expect("暂存失败"));
    assert_ok!(backend.fail_task(&task_id, "文档 a.pdf 无法解析"));
    sleep(Duration::from_millis(1_500)).await;

    let notices = viewer.notices().await;
    assert!(notices
        .iter()
        .any(|n| n.level == NoticeLevel::Error && n.message.contains("文档 a.pdf 无法解析")));
    assert_eq!(
        viewer.batch(&id).await.unwrap().status,
        BatchStatus::FailedStaging
    );
    assert!(!viewer.is_processing(&id).await);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_handle_stops_processing() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Saved);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    let task_id = task_id_of(&viewer.stage(&id).await.expect("暂存失败"));
    // 第一轮轮询看到进行中
    sleep(Duration::from_millis(100)).await;
    assert!(viewer.is_processing(&id).await);

    // 别的客户端读走了终态，任务被回收
    assert_ok!(backend.complete_task(&task_id));
    assert_ok!(backend.get_task_status(&task_id).await);

    sleep(Duration::from_millis(1_500)).await;
    assert!(!viewer.is_processing(&id).await);
    assert_eq!(viewer.tracker().active_sessions(), 0);
    assert!(has_notice(&viewer, "任务句柄无效").await);
    // 刷新后显示服务端的真实状态
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Staged);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_do_not_stop_polling() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Saved);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    let task_id = task_id_of(&viewer.stage(&id).await.expect("暂存失败"));
    sleep(Duration::from_millis(100)).await;

    backend.set_faults(BackendFaults {
        unavailable: true,
        ..Default::default()
    });
    assert_ok!(backend.complete_task(&task_id));

    // 几轮轮询都失败，会话仍在
    sleep(Duration::from_secs(3)).await;
    assert!(viewer.is_processing(&id).await);
    assert_eq!(viewer.tracker().active_sessions(), 1);
    assert!(viewer
        .notices()
        .await
        .iter()
        .all(|n| n.level != NoticeLevel::Error));

    // 恢复后下一轮拿到终态
    backend.set_faults(BackendFaults::default());
    sleep(Duration::from_millis(1_100)).await;
    assert!(!viewer.is_processing(&id).await);
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Staged);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_snapshot_task() {
    let backend = Arc::new(MemoryBackend::new(10));
    seed(&backend, "alpha", BatchStatus::Completed);
    let viewer = viewer_for(&backend);

    let rejected = viewer.start_maintenance(TaskKind::Stage, json!({})).await;
    assert!(matches!(rejected, Err(AppError::Validation(_))));

    let handle = viewer
        .start_maintenance(TaskKind::CreateSnapshot, json!({ "name": "nightly" }))
        .await
        .expect("启动快照任务失败");
    let task_id = handle.task_id.clone().expect("应该有任务 ID");
    let views = viewer.task_views().await;
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].key, TrackKey::maintenance(TaskKind::CreateSnapshot));

    assert_ok!(backend.complete_task(&task_id));
    sleep(Duration::from_millis(2_500)).await;

    assert_eq!(backend.snapshot_names(), vec!["nightly".to_string()]);
    assert!(viewer.task_views().await.is_empty());
    assert!(has_notice(&viewer, "已完成").await);
}

// ========== 仪表盘 ==========

#[tokio::test]
async fn test_selection_changes_aggregation_mode() {
    let backend = Arc::new(MemoryBackend::new(10));
    seed(&backend, "running", BatchStatus::Analyzing);
    let b = seed(&backend, "done-1", BatchStatus::Completed);
    let c = seed(&backend, "done-2", BatchStatus::Completed);
    let viewer = viewer_for(&backend);

    assert_ok!(viewer.refresh().await);
    let dashboard = viewer.dashboard().await.expect("应该已加载仪表盘");
    assert_eq!(dashboard.summary_stats.mode, AggregationMode::ActiveOnly);
    assert_eq!(dashboard.summary_stats.total_batches, 1);
    assert_eq!(dashboard.recent_batches.len(), 3);

    // 选中两个已完成批次：只看选中的，不论是否活跃
    assert_ok!(
        viewer
            .select(SelectionContext::new([b.clone(), c.clone(), BatchId::new("unknown")]))
            .await
    );
    let dashboard = viewer.dashboard().await.unwrap();
    assert_eq!(dashboard.summary_stats.mode, AggregationMode::Filtered);
    assert_eq!(dashboard.summary_stats.total_batches, 2);

    let local = viewer.local_summary().await;
    assert_eq!(local.mode, AggregationMode::Filtered);
    assert_eq!(local.total_batches, 2);

    assert_ok!(viewer.select(SelectionContext::empty()).await);
    assert_eq!(
        viewer.dashboard().await.unwrap().summary_stats.mode,
        AggregationMode::ActiveOnly
    );
}

#[tokio::test(start_paused = true)]
async fn test_auto_refresh_picks_up_server_changes() {
    let backend = Arc::new(MemoryBackend::new(10));
    let viewer = viewer_for(&backend);
    viewer.start_auto_refresh();
    sleep(Duration::from_millis(100)).await;
    assert!(viewer.batches().await.is_empty());
    assert!(viewer.last_refresh().await.is_some());

    let id = seed(&backend, "alpha", BatchStatus::Analyzing);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Analyzing);
}

// ========== 销毁 ==========

#[tokio::test(start_paused = true)]
async fn test_teardown_cancels_every_timer() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Saved);
    let viewer = viewer_for(&backend);
    assert_ok!(viewer.refresh().await);

    viewer.start_auto_refresh();
    let task_id = task_id_of(&viewer.stage(&id).await.expect("暂存失败"));
    sleep(Duration::from_millis(100)).await;
    // 事件消费 + 自动刷新 + 任务轮询 + 延迟刷新
    assert_eq!(viewer.active_timers(), 4);

    viewer.shutdown();
    assert_eq!(viewer.active_timers(), 0);

    // 销毁后没有人再轮询，终态任务不会被回收
    assert_ok!(backend.complete_task(&task_id));
    sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.task_count(), 1);
    assert_eq!(viewer.batch(&id).await.unwrap().status, BatchStatus::Staging);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_viewer_stops_polling() {
    let backend = Arc::new(MemoryBackend::new(10));
    let id = seed(&backend, "alpha", BatchStatus::Saved);
    let viewer = viewer_for(&backend);
    let task_id = task_id_of(&viewer.stage(&id).await.expect("暂存失败"));
    sleep(Duration::from_millis(100)).await;

    drop(viewer);
    assert_ok!(backend.complete_task(&task_id));
    sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.task_count(), 1);
}

// ========== 真实服务端 ==========

#[tokio::test]
#[ignore] // 默认忽略，需要手动运行：cargo test -- --ignored
async fn test_live_server_dashboard() {
    // 初始化日志
    logging::init(true);

    // 加载配置
    let config = Config::from_env();

    // 连接服务端
    let client = HttpBatchClient::new(&config).expect("创建客户端失败");
    let viewer = ViewerSession::new(Arc::new(client), ViewerSettings::from_config(&config));

    let report = viewer.refresh().await.expect("刷新失败");
    assert!(report.inconsistent.is_empty(), "服务端计数应该一致");
    assert!(viewer.dashboard().await.is_some(), "应该能够拿到仪表盘");
}

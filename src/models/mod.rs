pub mod batch;
pub mod dashboard;
pub mod loaders;
pub mod status;
pub mod task;

pub use batch::{
    Batch, BatchConfig, BatchFilter, BatchId, Document, DocumentCounts, DocumentStatus, Page,
    Response, ResponseCounts, ResponseQuery, ResponseStatus,
};
pub use dashboard::{AggregationMode, BatchProgress, DashboardSnapshot, SelectionContext, SummaryStats};
pub use loaders::{load_all_batch_configs, load_batch_config};
pub use status::BatchStatus;
pub use task::{ActionOutcome, ActionResponse, TaskHandle, TaskId, TaskKind, TaskState, TaskStatus};

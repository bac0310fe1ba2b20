pub mod channel;
pub mod clients;
pub mod config;
pub mod error;
pub mod guard;
pub mod orchestrator;
pub mod pairing;
pub mod pipeline;
pub mod queue;
mod sqlite;
pub mod tasks;
pub mod watcher;

pub use channel::{
    discover_channels, ensure_template, init_channel, ChannelConfig, ChannelDocuments,
    ChannelError, ChannelPaths, ChannelPreset, ChannelResult, HookAssets, VoiceSettings,
};
pub use clients::{
    poll_until, retry_transient, PollPolicy, PollStatus, RetryPolicy, ServiceError, ServiceResult,
};
pub use config::{
    load_workflow_config, DispatchMode, HookFailurePolicy, PromotionLayout, SubtitleSource,
    VideoMode, VoiceBackend, WorkflowConfig,
};
pub use error::{ConfigError, Result};
pub use guard::{InFlightGuard, InFlightPermit};
pub use orchestrator::{HandlerFactory, Orchestrator};
pub use pairing::{
    complete_pairs, find_pair, marker_of, pair_is_complete, prefix_of, ScriptMarker, ScriptPair,
};
pub use pipeline::{
    PipelineError, PipelineExecutor, PipelineOutcome, PipelineResult, PipelineServices,
    PipelineSettings, ProcessingContext, Stage, StageResult, TaskRecorder, UnitState,
};
pub use queue::{QueueReport, WorkHandler, WorkItem, WorkQueue, WorkQueueConsumer, WorkQueueHandle};
pub use tasks::{
    NewTask, SqliteTaskStore, SqliteTaskStoreBuilder, TaskError, TaskFilter, TaskPriority,
    TaskRecord, TaskResult, TaskStatus, TaskSummary,
};
pub use watcher::{ChannelWatcher, WatchError, WatchResult, WatcherSettings};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelPaths};
use crate::clients::ServiceError;
use crate::config::{DispatchMode, WorkflowConfig};
use crate::guard::InFlightGuard;
use crate::pairing::{classify, complete_pairs, find_pair};
use crate::queue::{QueueReport, WorkHandler, WorkItem, WorkQueue, WorkQueueHandle};
use crate::tasks::TaskError;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("channel {0} is already running")]
    AlreadyRunning(String),
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    pub dispatch: DispatchMode,
    pub shutdown_grace: Duration,
}

impl WatcherSettings {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            dispatch: config.pipeline.dispatch,
            shutdown_grace: config.pipeline.shutdown_grace(),
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::Fifo,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Reacts to one filesystem event in a `Scripts/` directory. Runs on the
/// notify thread and only talks to the queue handle.
pub fn handle_event(channel: &str, scripts: &Path, queue: &WorkQueueHandle, event: &Event) {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    if !relevant {
        return;
    }
    for path in &event.paths {
        let Some((marker, prefix)) = classify(path) else {
            continue;
        };
        debug!(channel, prefix = %prefix, marker = marker.as_str(), "script arrived");
        match find_pair(scripts, &prefix) {
            Some(pair) => {
                queue.enqueue(WorkItem::from_pair(pair));
            }
            None => info!(channel, prefix = %prefix, "waiting for pair"),
        }
    }
}

/// Watches one channel's `Scripts/` folder and feeds its work queue.
pub struct ChannelWatcher {
    paths: ChannelPaths,
    guard: InFlightGuard,
    queue: WorkQueueHandle,
    shutdown: watch::Sender<bool>,
    consumer: Option<JoinHandle<QueueReport>>,
    watcher: Option<RecommendedWatcher>,
    settings: WatcherSettings,
}

impl fmt::Debug for ChannelWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWatcher")
            .field("channel", &self.paths.name)
            .field("guard", &self.guard)
            .field("queue", &self.queue)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChannelWatcher {
    /// Starts the consumer task and the filesystem watcher, then queues every
    /// pair already waiting. Must be called inside a tokio runtime.
    pub fn start(
        paths: ChannelPaths,
        handler: Arc<dyn WorkHandler>,
        settings: WatcherSettings,
    ) -> WatchResult<Self> {
        paths.ensure()?;
        let channel = paths.name.clone();
        let guard = InFlightGuard::new();
        let (queue, consumer) = WorkQueue::new(&channel);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let consumer = match settings.dispatch {
            DispatchMode::Fifo => tokio::spawn(WorkQueue::run(
                consumer,
                guard.clone(),
                handler,
                shutdown_rx,
            )),
            DispatchMode::Parallel => tokio::spawn(WorkQueue::run_parallel(
                consumer,
                guard.clone(),
                handler,
                shutdown_rx,
            )),
        };

        let callback_queue = queue.clone();
        let callback_channel = channel.clone();
        let scripts = paths.scripts.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => handle_event(&callback_channel, &scripts, &callback_queue, &event),
                Err(err) => warn!(channel = %callback_channel, error = %err, "file watcher error"),
            }
        })?;
        if let Err(err) = watcher.watch(&paths.scripts, RecursiveMode::NonRecursive) {
            consumer.abort();
            return Err(err.into());
        }

        let backlog = complete_pairs(&paths.scripts);
        let queued = backlog
            .into_iter()
            .filter(|pair| queue.enqueue(WorkItem::from_pair(pair.clone())))
            .count();
        info!(
            channel = %channel,
            scripts = %paths.scripts.display(),
            backlog = queued,
            dispatch = ?settings.dispatch,
            "channel watcher started"
        );
        Ok(Self {
            paths,
            guard,
            queue,
            shutdown,
            consumer: Some(consumer),
            watcher: Some(watcher),
            settings,
        })
    }

    pub fn name(&self) -> &str {
        &self.paths.name
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    pub fn guard(&self) -> &InFlightGuard {
        &self.guard
    }

    pub fn queue(&self) -> &WorkQueueHandle {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.consumer
            .as_ref()
            .map(|consumer| !consumer.is_finished())
            .unwrap_or(false)
    }

    /// Stops watching, lets running work finish within the grace period and
    /// abandons it afterwards.
    pub async fn stop(mut self) -> QueueReport {
        self.watcher.take();
        let _ = self.shutdown.send(true);
        let Some(mut consumer) = self.consumer.take() else {
            return QueueReport::default();
        };
        let channel = self.paths.name.clone();
        match tokio::time::timeout(self.settings.shutdown_grace, &mut consumer).await {
            Ok(Ok(report)) => {
                info!(
                    channel = %channel,
                    processed = report.processed,
                    dropped = report.dropped,
                    abandoned = report.abandoned.len(),
                    "channel watcher stopped"
                );
                report
            }
            Ok(Err(err)) => {
                warn!(channel = %channel, error = %err, "channel consumer ended abnormally");
                QueueReport::default()
            }
            Err(_) => {
                let in_flight = self.guard.snapshot();
                let queued = self.queue.pending();
                consumer.abort();
                let mut report = QueueReport::default();
                for prefix in in_flight {
                    warn!(
                        channel = %channel,
                        prefix = %prefix,
                        "abandoned in-flight work; files may remain in Working"
                    );
                    report.abandoned.push(prefix);
                }
                for prefix in queued {
                    warn!(
                        channel = %channel,
                        prefix = %prefix,
                        "queued work not started before shutdown; scripts stay in Scripts"
                    );
                    report.abandoned.push(prefix);
                }
                report
            }
        }
    }
}

impl Drop for ChannelWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

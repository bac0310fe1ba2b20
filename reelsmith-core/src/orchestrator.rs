use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::channel::{discover_channels, ensure_template, ChannelPaths};
use crate::config::WorkflowConfig;
use crate::pipeline::{PipelineExecutor, PipelineServices, PipelineSettings, TaskRecorder};
use crate::queue::{QueueReport, WorkHandler};
use crate::tasks::SqliteTaskStore;
use crate::watcher::{ChannelWatcher, WatchError, WatchResult, WatcherSettings};

/// Builds the work handler for a channel when its watcher starts.
pub type HandlerFactory =
    Arc<dyn Fn(&ChannelPaths) -> WatchResult<Arc<dyn WorkHandler>> + Send + Sync>;

/// Owns one [`ChannelWatcher`] per running channel of a workflow root.
pub struct Orchestrator {
    root: PathBuf,
    settings: WatcherSettings,
    factory: HandlerFactory,
    watchers: Mutex<BTreeMap<String, ChannelWatcher>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.root)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(root: impl Into<PathBuf>, settings: WatcherSettings, factory: HandlerFactory) -> Self {
        Self {
            root: root.into(),
            settings,
            factory,
            watchers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Wires real service clients, the optional task store and a pipeline
    /// executor per channel.
    pub fn from_config(config: &WorkflowConfig) -> WatchResult<Self> {
        let settings = Arc::new(PipelineSettings::from_config(config));
        let services = PipelineServices::from_config(config)?;
        let recorder = match config.task_db_path() {
            Some(path) => TaskRecorder::new(Some(open_task_store(&path)?)),
            None => TaskRecorder::default(),
        };
        let factory: HandlerFactory = Arc::new(move |paths: &ChannelPaths| {
            let executor = PipelineExecutor::new(paths.clone(), settings.clone(), services.clone())
                .with_recorder(recorder.clone());
            Ok(Arc::new(executor) as Arc<dyn WorkHandler>)
        });
        Ok(Self::new(
            config.workflow.root_dir.clone(),
            WatcherSettings::from_config(config),
            factory,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts every valid channel that is not running yet and returns the
    /// names of the ones started by this call.
    pub async fn start_all_channels(&self) -> WatchResult<Vec<String>> {
        ensure_template(&self.root)?;
        let channels = discover_channels(&self.root)?;
        let mut watchers = self.watchers.lock().await;
        let mut started = Vec::new();
        for paths in channels {
            if watchers.contains_key(&paths.name) {
                continue;
            }
            if let Err(err) = paths.validate() {
                warn!(channel = %paths.name, error = %err, "skipping invalid channel");
                continue;
            }
            let name = paths.name.clone();
            match self.spawn_watcher(paths) {
                Ok(watcher) => {
                    watchers.insert(name.clone(), watcher);
                    started.push(name);
                }
                Err(err) => warn!(channel = %name, error = %err, "failed to start channel"),
            }
        }
        info!(
            root = %self.root.display(),
            started = started.len(),
            running = watchers.len(),
            "channels started"
        );
        Ok(started)
    }

    pub async fn start_channel(&self, name: &str) -> WatchResult<()> {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(name) {
            return Err(WatchError::AlreadyRunning(name.to_string()));
        }
        let paths = ChannelPaths::new(&self.root, name);
        if name.starts_with('_') || !paths.root.is_dir() {
            return Err(WatchError::UnknownChannel(name.to_string()));
        }
        paths.validate()?;
        let watcher = self.spawn_watcher(paths)?;
        watchers.insert(name.to_string(), watcher);
        Ok(())
    }

    pub async fn stop_channel(&self, name: &str) -> WatchResult<QueueReport> {
        let watcher = self
            .watchers
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| WatchError::UnknownChannel(name.to_string()))?;
        Ok(watcher.stop().await)
    }

    /// Stops every running channel concurrently.
    pub async fn stop(&self) -> BTreeMap<String, QueueReport> {
        let watchers = std::mem::take(&mut *self.watchers.lock().await);
        let stops = watchers.into_iter().map(|(name, watcher)| async move {
            let report = watcher.stop().await;
            (name, report)
        });
        join_all(stops).await.into_iter().collect()
    }

    pub async fn running_channels(&self) -> Vec<String> {
        self.watchers.lock().await.keys().cloned().collect()
    }

    fn spawn_watcher(&self, paths: ChannelPaths) -> WatchResult<ChannelWatcher> {
        let handler = (self.factory)(&paths)?;
        ChannelWatcher::start(paths, handler, self.settings)
    }
}

fn open_task_store(path: &Path) -> WatchResult<SqliteTaskStore> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| WatchError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
    }
    let store = SqliteTaskStore::new(path)?;
    store.initialize()?;
    Ok(store)
}

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

use reelsmith_core::channel::{init_channel, ChannelPaths};
use reelsmith_core::config::DispatchMode;
use reelsmith_core::guard::InFlightGuard;
use reelsmith_core::orchestrator::{HandlerFactory, Orchestrator};
use reelsmith_core::pipeline::PipelineOutcome;
use reelsmith_core::queue::{WorkHandler, WorkItem, WorkQueue};
use reelsmith_core::watcher::{handle_event, ChannelWatcher, WatchError, WatcherSettings};

/// Consumes the pair like the real pipeline would and reports each prefix.
struct Recording {
    calls: AtomicUsize,
    seen: mpsc::UnboundedSender<String>,
}

impl Recording {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen,
            }),
            rx,
        )
    }
}

#[async_trait]
impl WorkHandler for Recording {
    async fn handle(&self, item: WorkItem) -> PipelineOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = fs::remove_file(&item.hook);
        let _ = fs::remove_file(&item.kb);
        let _ = self.seen.send(item.prefix.clone());
        PipelineOutcome::Completed {
            video: PathBuf::from(format!("/final/{}.mp4", item.prefix)),
        }
    }
}

/// Never finishes; used to exercise the shutdown grace period.
struct Stuck;

#[async_trait]
impl WorkHandler for Stuck {
    async fn handle(&self, _item: WorkItem) -> PipelineOutcome {
        std::future::pending::<PipelineOutcome>().await
    }
}

fn created(path: PathBuf) -> Event {
    Event::new(EventKind::Create(CreateKind::File)).add_path(path)
}

fn scripts_dir(temp: &TempDir) -> PathBuf {
    let scripts = temp.path().join("news/Scripts");
    fs::create_dir_all(&scripts).unwrap();
    scripts
}

async fn next_prefix(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler was not called")
        .expect("handler channel closed")
}

#[tokio::test]
async fn hook_and_kb_events_trigger_exactly_one_execution() {
    let temp = TempDir::new().unwrap();
    let scripts = scripts_dir(&temp);
    let (queue, consumer) = WorkQueue::new("news");

    let hook = scripts.join("ABC_hook.txt");
    fs::write(&hook, "hook").unwrap();
    handle_event("news", &scripts, &queue, &created(hook.clone()));
    assert!(queue.pending().is_empty(), "half a pair must not be queued");

    let kb = scripts.join("ABC_kb.txt");
    fs::write(&kb, "kb").unwrap();
    handle_event("news", &scripts, &queue, &created(kb.clone()));
    let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(hook);
    handle_event("news", &scripts, &queue, &renamed);
    assert_eq!(queue.pending(), vec!["ABC".to_string()]);

    let (handler, mut seen) = Recording::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let guard = InFlightGuard::new();
    let run = tokio::spawn(WorkQueue::run(
        consumer,
        guard.clone(),
        handler.clone(),
        shutdown_rx,
    ));

    assert_eq!(next_prefix(&mut seen).await, "ABC");
    handle_event("news", &scripts, &queue, &created(kb));
    shutdown.send(true).unwrap();
    let report = run.await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.processed, 1);
    assert!(report.abandoned.is_empty());
    assert!(guard.is_empty());
}

#[tokio::test]
async fn in_flight_prefix_is_dropped_without_side_effects() {
    let temp = TempDir::new().unwrap();
    let scripts = scripts_dir(&temp);
    fs::write(scripts.join("ABC_hook.txt"), "hook").unwrap();
    fs::write(scripts.join("ABC_kb.txt"), "kb").unwrap();
    fs::write(scripts.join("XYZ_hook.txt"), "hook").unwrap();
    fs::write(scripts.join("XYZ_kb.txt"), "kb").unwrap();

    let guard = InFlightGuard::new();
    let held = guard.try_acquire("ABC").unwrap();
    let (queue, consumer) = WorkQueue::new("news");
    handle_event("news", &scripts, &queue, &created(scripts.join("ABC_kb.txt")));
    handle_event("news", &scripts, &queue, &created(scripts.join("XYZ_kb.txt")));

    let (handler, mut seen) = Recording::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(WorkQueue::run(consumer, guard.clone(), handler.clone(), shutdown_rx));

    assert_eq!(next_prefix(&mut seen).await, "XYZ");
    shutdown.send(true).unwrap();
    let report = run.await.unwrap();

    assert_eq!(report.dropped, 1);
    assert_eq!(report.processed, 1);
    assert!(scripts.join("ABC_hook.txt").exists());
    assert!(scripts.join("ABC_kb.txt").exists());
    assert!(guard.contains("ABC"));
    drop(held);
    assert!(!guard.contains("ABC"));
}

#[tokio::test]
async fn parallel_dispatch_processes_every_prefix() {
    let temp = TempDir::new().unwrap();
    let scripts = scripts_dir(&temp);
    let (queue, consumer) = WorkQueue::new("news");
    for prefix in ["A1", "B2", "C3"] {
        fs::write(scripts.join(format!("{prefix}_hook.txt")), "hook").unwrap();
        fs::write(scripts.join(format!("{prefix}_kb.txt")), "kb").unwrap();
        handle_event(
            "news",
            &scripts,
            &queue,
            &created(scripts.join(format!("{prefix}_kb.txt"))),
        );
    }

    let (handler, mut seen) = Recording::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(WorkQueue::run_parallel(
        consumer,
        InFlightGuard::new(),
        handler.clone(),
        shutdown_rx,
    ));
    let mut prefixes = vec![
        next_prefix(&mut seen).await,
        next_prefix(&mut seen).await,
        next_prefix(&mut seen).await,
    ];
    prefixes.sort();
    shutdown.send(true).unwrap();
    let report = run.await.unwrap();

    assert_eq!(prefixes, vec!["A1", "B2", "C3"]);
    assert_eq!(report.processed, 3);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn watcher_processes_backlog_on_start() {
    let temp = TempDir::new().unwrap();
    let paths = ChannelPaths::new(temp.path(), "news");
    paths.ensure().unwrap();
    fs::write(paths.scripts.join("ABC_hook.txt"), "hook").unwrap();
    fs::write(paths.scripts.join("ABC_kb.txt"), "kb").unwrap();
    fs::write(paths.scripts.join("LONE_hook.txt"), "hook").unwrap();

    let (handler, mut seen) = Recording::new();
    let watcher = ChannelWatcher::start(paths, handler.clone(), WatcherSettings::default()).unwrap();
    assert!(watcher.is_running());
    assert_eq!(next_prefix(&mut seen).await, "ABC");

    let report = watcher.stop().await;
    assert_eq!(report.processed, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_abandons_work_past_the_grace_period() {
    let temp = TempDir::new().unwrap();
    let paths = ChannelPaths::new(temp.path(), "news");
    paths.ensure().unwrap();
    fs::write(paths.scripts.join("ABC_hook.txt"), "hook").unwrap();
    fs::write(paths.scripts.join("ABC_kb.txt"), "kb").unwrap();
    fs::write(paths.scripts.join("XYZ_hook.txt"), "hook").unwrap();
    fs::write(paths.scripts.join("XYZ_kb.txt"), "kb").unwrap();

    let settings = WatcherSettings {
        dispatch: DispatchMode::Fifo,
        shutdown_grace: Duration::from_millis(50),
    };
    let watcher = ChannelWatcher::start(paths, Arc::new(Stuck), settings).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while watcher.guard().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first unit never started");
    let in_flight = watcher.guard().snapshot();

    let mut report = watcher.stop().await;
    report.abandoned.sort();

    assert_eq!(in_flight.len(), 1);
    assert_eq!(report.abandoned, vec!["ABC".to_string(), "XYZ".to_string()]);
}

fn recording_factory(calls: Arc<Mutex<Vec<String>>>) -> HandlerFactory {
    Arc::new(move |paths: &ChannelPaths| {
        calls.lock().unwrap().push(paths.name.clone());
        let (handler, _rx) = Recording::new();
        Ok(handler as Arc<dyn WorkHandler>)
    })
}

#[tokio::test]
async fn orchestrator_starts_valid_channels_once() {
    let temp = TempDir::new().unwrap();
    init_channel(temp.path(), "news").unwrap();
    init_channel(temp.path(), "sports").unwrap();
    ChannelPaths::new(temp.path(), "broken").ensure().unwrap();

    let built = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = Orchestrator::new(
        temp.path(),
        WatcherSettings::default(),
        recording_factory(built.clone()),
    );

    let started = orchestrator.start_all_channels().await.unwrap();
    assert_eq!(started, vec!["news".to_string(), "sports".to_string()]);
    assert!(orchestrator.start_all_channels().await.unwrap().is_empty());
    assert!(matches!(
        orchestrator.start_channel("news").await,
        Err(WatchError::AlreadyRunning(_))
    ));
    assert!(matches!(
        orchestrator.start_channel("missing").await,
        Err(WatchError::UnknownChannel(_))
    ));
    assert_eq!(built.lock().unwrap().len(), 2);

    orchestrator.stop_channel("sports").await.unwrap();
    assert_eq!(orchestrator.running_channels().await, vec!["news".to_string()]);
    orchestrator.start_channel("sports").await.unwrap();

    let reports = orchestrator.stop().await;
    assert_eq!(reports.len(), 2);
    assert!(orchestrator.running_channels().await.is_empty());
}

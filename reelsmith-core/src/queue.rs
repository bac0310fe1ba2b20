use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::guard::InFlightGuard;
use crate::pairing::ScriptPair;
use crate::pipeline::PipelineOutcome;

/// One complete pair waiting to be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub prefix: String,
    pub hook: PathBuf,
    pub kb: PathBuf,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn from_pair(pair: ScriptPair) -> Self {
        Self {
            prefix: pair.prefix,
            hook: pair.hook,
            kb: pair.kb,
            enqueued_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: WorkItem) -> PipelineOutcome;
}

type PendingSet = Arc<Mutex<HashSet<String>>>;

/// Producer side of a channel's queue. Safe to use from any thread.
#[derive(Clone)]
pub struct WorkQueueHandle {
    channel: Arc<str>,
    sender: mpsc::UnboundedSender<WorkItem>,
    pending: PendingSet,
}

impl fmt::Debug for WorkQueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueueHandle")
            .field("channel", &self.channel)
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkQueueHandle {
    /// Queues `item` unless its prefix is already waiting. Returns whether it
    /// was queued.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        let prefix = item.prefix.clone();
        {
            let mut pending = self.pending.lock().expect("pending set poisoned");
            if !pending.insert(prefix.clone()) {
                debug!(channel = %self.channel, prefix = %prefix, "prefix already queued");
                return false;
            }
        }
        if self.sender.send(item).is_err() {
            self.pending
                .lock()
                .expect("pending set poisoned")
                .remove(&prefix);
            warn!(channel = %self.channel, prefix = %prefix, "queue closed; item not accepted");
            return false;
        }
        info!(channel = %self.channel, prefix = %prefix, "queued unit of work");
        true
    }

    pub fn is_pending(&self, prefix: &str) -> bool {
        self.pending
            .lock()
            .expect("pending set poisoned")
            .contains(prefix)
    }

    pub fn pending(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .pending
            .lock()
            .expect("pending set poisoned")
            .iter()
            .cloned()
            .collect();
        prefixes.sort();
        prefixes
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer side; owned by exactly one run loop.
pub struct WorkQueueConsumer {
    channel: Arc<str>,
    receiver: mpsc::UnboundedReceiver<WorkItem>,
    pending: PendingSet,
}

impl fmt::Debug for WorkQueueConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueueConsumer")
            .field("channel", &self.channel)
            .finish()
    }
}

impl WorkQueueConsumer {
    pub async fn next(&mut self) -> Option<WorkItem> {
        let item = self.receiver.recv().await?;
        self.clear_pending(&item.prefix);
        Some(item)
    }

    /// Closes the queue and returns whatever was still waiting.
    pub fn drain(&mut self) -> Vec<WorkItem> {
        self.receiver.close();
        let mut items = Vec::new();
        while let Ok(item) = self.receiver.try_recv() {
            self.clear_pending(&item.prefix);
            items.push(item);
        }
        items
    }

    fn clear_pending(&self, prefix: &str) {
        self.pending
            .lock()
            .expect("pending set poisoned")
            .remove(prefix);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub processed: usize,
    pub dropped: usize,
    pub abandoned: Vec<String>,
}

pub struct WorkQueue;

impl WorkQueue {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(channel: &str) -> (WorkQueueHandle, WorkQueueConsumer) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending: PendingSet = Arc::new(Mutex::new(HashSet::new()));
        let channel: Arc<str> = Arc::from(channel);
        (
            WorkQueueHandle {
                channel: channel.clone(),
                sender,
                pending: pending.clone(),
            },
            WorkQueueConsumer {
                channel,
                receiver,
                pending,
            },
        )
    }

    /// Processes items strictly one at a time in arrival order until
    /// `shutdown` flips to true. A running item is allowed to finish.
    pub async fn run(
        mut consumer: WorkQueueConsumer,
        guard: InFlightGuard,
        handler: Arc<dyn WorkHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> QueueReport {
        let mut report = QueueReport::default();
        while !*shutdown.borrow() {
            let item = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                item = consumer.next() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let Some(permit) = guard.try_acquire(&item.prefix) else {
                info!(channel = %consumer.channel, prefix = %item.prefix, "prefix already in flight; dropping");
                report.dropped += 1;
                continue;
            };
            // A JoinSet of one keeps a panicking handler from taking the
            // consumer down, and aborts the unit if this future is dropped.
            let mut unit = JoinSet::new();
            let handler = handler.clone();
            let channel = consumer.channel.clone();
            unit.spawn(async move {
                let outcome = handler.handle(item).await;
                log_outcome(&channel, permit.prefix(), &outcome);
                drop(permit);
            });
            if let Some(Err(err)) = unit.join_next().await {
                warn!(channel = %consumer.channel, error = %err, "unit of work task failed");
            }
            report.processed += 1;
        }
        report.abandoned = abandon(&mut consumer);
        report
    }

    /// Like [`WorkQueue::run`], but every item runs in its own task. Running
    /// tasks are awaited before returning.
    pub async fn run_parallel(
        mut consumer: WorkQueueConsumer,
        guard: InFlightGuard,
        handler: Arc<dyn WorkHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> QueueReport {
        let mut report = QueueReport::default();
        let mut running: JoinSet<()> = JoinSet::new();
        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(err) = joined {
                        warn!(channel = %consumer.channel, error = %err, "unit of work task failed");
                    }
                    report.processed += 1;
                }
                item = consumer.next() => {
                    let Some(item) = item else { break };
                    let Some(permit) = guard.try_acquire(&item.prefix) else {
                        info!(channel = %consumer.channel, prefix = %item.prefix, "prefix already in flight; dropping");
                        report.dropped += 1;
                        continue;
                    };
                    let handler = handler.clone();
                    let channel = consumer.channel.clone();
                    running.spawn(async move {
                        let outcome = handler.handle(item).await;
                        log_outcome(&channel, permit.prefix(), &outcome);
                        drop(permit);
                    });
                }
            }
        }
        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                warn!(channel = %consumer.channel, error = %err, "unit of work task failed");
            }
            report.processed += 1;
        }
        report.abandoned = abandon(&mut consumer);
        report
    }
}

fn abandon(consumer: &mut WorkQueueConsumer) -> Vec<String> {
    consumer
        .drain()
        .into_iter()
        .map(|item| {
            warn!(
                channel = %consumer.channel,
                prefix = %item.prefix,
                "queued work not started before shutdown; scripts stay in Scripts"
            );
            item.prefix
        })
        .collect()
}

fn log_outcome(channel: &str, prefix: &str, outcome: &PipelineOutcome) {
    match outcome {
        PipelineOutcome::Completed { video } => {
            info!(channel, prefix, video = %video.display(), "unit of work completed")
        }
        PipelineOutcome::Failed { stage, message } => {
            warn!(channel, prefix, stage = %stage, error = %message, "unit of work failed")
        }
        PipelineOutcome::Skipped { reason } => {
            info!(channel, prefix, reason = %reason, "unit of work skipped")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(prefix: &str) -> WorkItem {
        WorkItem {
            prefix: prefix.into(),
            hook: PathBuf::from(format!("/s/{prefix}_hook.txt")),
            kb: PathBuf::from(format!("/s/{prefix}_kb.txt")),
            enqueued_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct PanicsOnBad {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkHandler for PanicsOnBad {
        async fn handle(&self, item: WorkItem) -> PipelineOutcome {
            if item.prefix == "BAD" {
                panic!("handler blew up");
            }
            self.seen.lock().unwrap().push(item.prefix.clone());
            PipelineOutcome::Skipped {
                reason: "test".into(),
            }
        }
    }

    #[tokio::test]
    async fn fifo_consumer_survives_a_panicking_handler() {
        let (handle, consumer) = WorkQueue::new("alpha");
        handle.enqueue(item("BAD"));
        handle.enqueue(item("OK"));
        let handler = Arc::new(PanicsOnBad::default());
        let guard = InFlightGuard::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(WorkQueue::run(
            consumer,
            guard.clone(),
            handler.clone(),
            shutdown_rx,
        ));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while handler.seen.lock().unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("item after the panic was never handled");
        shutdown.send(true).unwrap();
        let report = run.await.unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec!["OK".to_string()]);
        assert_eq!(report.processed, 2);
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn duplicate_prefix_is_not_queued_twice() {
        let (handle, mut consumer) = WorkQueue::new("alpha");
        assert!(handle.enqueue(item("ABC")));
        assert!(!handle.enqueue(item("ABC")));
        assert!(handle.enqueue(item("XYZ")));
        assert_eq!(handle.pending(), vec!["ABC".to_string(), "XYZ".to_string()]);

        let first = consumer.next().await.unwrap();
        assert_eq!(first.prefix, "ABC");
        assert!(!handle.is_pending("ABC"));
        assert!(handle.enqueue(item("ABC")));
    }

    #[tokio::test]
    async fn drain_returns_leftovers_and_closes() {
        let (handle, mut consumer) = WorkQueue::new("alpha");
        handle.enqueue(item("ABC"));
        handle.enqueue(item("XYZ"));
        let leftovers: Vec<String> = consumer.drain().into_iter().map(|i| i.prefix).collect();
        assert_eq!(leftovers, vec!["ABC".to_string(), "XYZ".to_string()]);
        assert!(!handle.enqueue(item("NEW")));
        assert!(handle.pending().is_empty());
    }
}

use tracing::warn;

use crate::tasks::{NewTask, SqliteTaskStore, TaskResult};

/// Writes task records beside the pipeline. A failing store is logged and
/// otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct TaskRecorder {
    store: Option<SqliteTaskStore>,
}

impl TaskRecorder {
    pub fn new(store: Option<SqliteTaskStore>) -> Self {
        Self { store }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    async fn run<F, T>(&self, action: &'static str, operation: F) -> Option<T>
    where
        F: FnOnce(&SqliteTaskStore) -> TaskResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone()?;
        match tokio::task::spawn_blocking(move || operation(&store)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                warn!(action, error = %err, "task store update failed");
                None
            }
            Err(err) => {
                warn!(action, error = %err, "task store worker failed");
                None
            }
        }
    }

    /// Creates the record and marks it as processing.
    pub async fn start(&self, task: NewTask) -> Option<i64> {
        self.run("start", move |store| {
            let id = store.create(&task)?;
            store.mark_processing(id)?;
            Ok(id)
        })
        .await
    }

    pub async fn complete(&self, id: Option<i64>, remote_task_id: Option<String>) {
        let Some(id) = id else { return };
        self.run("complete", move |store| {
            store.mark_completed(id, remote_task_id.as_deref())
        })
        .await;
    }

    pub async fn fail(&self, id: Option<i64>, message: String) {
        let Some(id) = id else { return };
        self.run("fail", move |store| store.mark_error(id, &message))
            .await;
    }
}

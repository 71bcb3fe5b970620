use tokio::task::JoinHandle;

/// Owns a spawned task and aborts it when dropped.
pub(crate) struct TaskHandle {
    task: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Waits for the task to finish on its own.
    pub(crate) async fn wait(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl From<JoinHandle<()>> for TaskHandle {
    fn from(task: JoinHandle<()>) -> Self {
        TaskHandle { task: Some(task) }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

//! Task management for async service lifecycle.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the background tasks of every service.
///
/// All tasks share one cancellation root. Shutdown cancels it and then waits
/// for each task up to the shutdown timeout, so a task that is in the middle
/// of a write sequence gets to finish it.
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    shutdown_timeout: Duration,
    pub global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            global_token: CancellationToken::new(),
        }
    }

    /// Sets how long shutdown waits for each task.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Spawns and registers a task with the given name.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if self.tasks.contains_key(&name) {
            anyhow::bail!("Task '{name}' is already registered");
        }
        let task_token = self.global_token.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            match task_fn(task_token).await {
                Ok(()) => {
                    info!("Task '{task_name}' completed");
                    Ok(())
                }
                Err(e) => {
                    error!("Task '{task_name}' failed: {e:#}");
                    Err(e)
                }
            }
        });

        self.tasks.insert(name, handle);
        Ok(())
    }

    /// Cancels every task and waits for each to finish.
    ///
    /// Returns the first error encountered, if any.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.global_token.cancel();

        let mut first_error = None;
        for (name, handle) in self.tasks.drain() {
            let error = match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => {
                    warn!("Task '{name}' failed during shutdown: {e:#}");
                    e
                }
                Ok(Err(e)) => {
                    error!("Task '{name}' panicked: {e}");
                    anyhow::anyhow!("Task '{name}' panicked: {e}")
                }
                Err(_) => {
                    error!(
                        "Task '{name}' did not stop within {:?}",
                        self.shutdown_timeout
                    );
                    anyhow::anyhow!("Task '{name}' shutdown timeout exceeded")
                }
            };
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    /// Number of registered tasks.
    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

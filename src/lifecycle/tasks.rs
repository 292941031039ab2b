//! Supervised background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::Shutdown;

/// A set of named background loops sharing one shutdown signal.
#[derive(Debug, Default)]
pub struct TaskGroup {
    shutdown: Shutdown,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a loop. The receiver is subscribed before the task starts, so a
    /// signal sent right after `spawn` returns is never missed.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let rx = self.shutdown.subscribe();
        tracing::debug!(task = %name, "Spawning background task");
        self.handles.push((name, tokio::spawn(task(rx))));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of tasks that have not finished yet.
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Signal every task without waiting. Used when a loop tears down its own group.
    pub fn cancel(self) {
        self.shutdown.trigger();
    }

    /// Signal every task and wait for each to return, aborting any that miss the deadline.
    pub async fn stop(self, deadline: Duration) {
        self.shutdown.trigger();
        for (name, mut handle) in self.handles {
            match tokio::time::timeout(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "Background task stopped"),
                Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "Background task ended abnormally"),
                Err(_) => {
                    tracing::warn!(task = %name, "Background task missed shutdown deadline, aborting");
                    handle.abort();
                }
            }
        }
    }
}

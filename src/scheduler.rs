//! Named background tasks sharing the runtime
//!
//! The binary runs on a current-thread runtime, so only one task executes at
//! a time and control changes hands at `.await` points. A task that fails or
//! panics is logged and the rest keep running.

use std::fmt::Display;
use std::future::Future;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, Instrument};

type TaskExit = (String, Result<(), String>);

#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: JoinSet<TaskExit>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a named background task
    pub fn spawn<F, E>(&mut self, name: &str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let span = info_span!("task", name = %name);
        let name = name.to_string();
        debug!(task = %name, "Starting task");
        self.tasks.spawn(
            async move {
                let result = task.await.map_err(|e| e.to_string());
                (name, result)
            }
            .instrument(span),
        );
    }

    /// Live background tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drive `main` while reaping background exits
    ///
    /// When `main` completes every background task is aborted and awaited
    /// before its output is returned.
    pub async fn run_until<F: Future>(&mut self, main: F) -> F::Output {
        tokio::pin!(main);
        let output = loop {
            tokio::select! {
                output = &mut main => break output,
                Some(exit) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    Self::reap(exit);
                }
            }
        };
        self.shutdown().await;
        output
    }

    /// Abort all background tasks and wait for them to finish
    pub async fn shutdown(&mut self) {
        let remaining = self.tasks.len();
        self.tasks.shutdown().await;
        if remaining > 0 {
            debug!(remaining, "Background tasks stopped");
        }
    }

    fn reap(exit: Result<TaskExit, JoinError>) {
        match exit {
            Ok((name, Ok(()))) => info!(task = %name, "Task finished"),
            Ok((name, Err(e))) => error!(task = %name, error = %e, "Task failed"),
            Err(e) if e.is_panic() => error!(error = %e, "Task panicked"),
            Err(e) => debug!(error = %e, "Task cancelled"),
        }
    }
}

//! Per-operation state shared by every step of a move or upgrade.
//!
//! A [`MigrationContext`] owns the task manager (and with it the
//! cancellation token), the progress sink and the stack of cleanup actions
//! registered as transient objects are created. Cleanups run newest first,
//! on every exit path, against a task manager that ignores the token so an
//! interrupted operation still releases what it created.

use crate::error::{MigrateError, Result};
use crate::progress::{Progress, ProgressEvent};
use futures_util::future::BoxFuture;
use hostpathpv_cluster::TaskManager;
use parking_lot::Mutex;
use std::future::Future;
use tracing::{debug, warn};

type CleanupAction =
    Box<dyn FnOnce(TaskManager) -> BoxFuture<'static, hostpathpv_cluster::Result<()>> + Send>;

struct Cleanup {
    label: String,
    action: CleanupAction,
}

pub struct MigrationContext {
    tasks: TaskManager,
    progress: Progress,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl MigrationContext {
    pub fn new(tasks: TaskManager, progress: Progress) -> Self {
        Self {
            tasks,
            progress,
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Push a cleanup action; it receives a detached task manager.
    ///
    /// Steps register from inside their own future, right after the object
    /// the action removes has been created.
    pub fn register<F, Fut>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce(TaskManager) -> Fut + Send + 'static,
        Fut: Future<Output = hostpathpv_cluster::Result<()>> + Send + 'static,
    {
        let label = label.into();
        debug!(cleanup = %label, "Registered cleanup");
        self.cleanups.lock().push(Cleanup {
            label,
            action: Box::new(move |tasks| Box::pin(action(tasks))),
        });
    }

    /// Labels of the registered cleanups, oldest first
    pub fn pending_cleanups(&self) -> Vec<String> {
        self.cleanups.lock().iter().map(|c| c.label.clone()).collect()
    }

    /// Run one numbered step, reporting its start and outcome.
    ///
    /// A step is never started once the token has fired, and a started step
    /// is never dropped midway: cancellation only surfaces at the waits the
    /// step itself performs, and is then reported as `Interrupted`. A step
    /// with no cancellable wait therefore always runs to completion.
    pub async fn step<T, F>(&self, step: usize, description: impl Into<String>, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.run_step(step, description, work, true).await
    }

    /// Run a step that completes a change the previous step began.
    ///
    /// Unlike [`step`](Self::step) it starts even after the token fired.
    pub async fn commit_step<T, F>(&self, step: usize, description: impl Into<String>, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.run_step(step, description, work, false).await
    }

    async fn run_step<T, F>(
        &self,
        step: usize,
        description: impl Into<String>,
        work: F,
        check_start: bool,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.progress.started(step, description);
        let outcome = if check_start && self.tasks.token().is_cancelled() {
            Err(MigrateError::Interrupted { step })
        } else {
            work.await.map_err(|e| {
                if e.is_interrupted() {
                    MigrateError::Interrupted { step }
                } else {
                    e
                }
            })
        };

        match &outcome {
            Ok(_) => self.progress.finished(step, true, None),
            Err(e) => {
                debug!(step, error = %e, "Step failed");
                self.progress.finished(step, false, Some(e.to_string()));
            }
        }
        outcome
    }

    /// Run and drop every registered cleanup, newest first.
    ///
    /// Failures are logged and reported, never returned. Returns the labels
    /// in the order they ran.
    pub async fn cleanup(&self) -> Vec<String> {
        let tasks = self.tasks.detached();
        let mut ran = Vec::new();
        loop {
            let Some(Cleanup { label, action }) = self.cleanups.lock().pop() else {
                break;
            };
            let ok = match action(tasks.clone()).await {
                Ok(()) => {
                    debug!(cleanup = %label, "Cleanup done");
                    true
                }
                Err(e) => {
                    warn!(cleanup = %label, error = %e, "Cleanup failed");
                    false
                }
            };
            self.progress.send(ProgressEvent::Cleanup {
                label: label.clone(),
                ok,
            });
            ran.push(label);
        }
        ran
    }

    /// Release everything, then print the summary of a successful run
    pub async fn finish(&self, result: Result<String>) -> Result<()> {
        self.cleanup().await;
        let summary = result?;
        self.progress.summary(summary);
        Ok(())
    }
}

//! Background run workers
//!
//! A [`RunWorker`] is a tokio task draining a queue of submitted runs in
//! order. Each job carries the work future and the caller's completion
//! callback; the worker invokes the callback exactly once per job, including
//! when the work panics or the queue is drained at shutdown.

use crate::dispatcher::RunOutput;
use crate::error::{Result, SessionError};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Completion callback of an asynchronous run
pub type RunCallback = Box<dyn FnOnce(Result<RunOutput>) + Send + 'static>;

type RunFuture = Pin<Box<dyn Future<Output = Result<RunOutput>> + Send + 'static>>;

/// One queued asynchronous run
pub struct RunJob {
    pub graph_id: u32,
    work: RunFuture,
    callback: RunCallback,
}

impl RunJob {
    pub fn new<F>(graph_id: u32, work: F, callback: RunCallback) -> Self
    where
        F: Future<Output = Result<RunOutput>> + Send + 'static,
    {
        Self {
            graph_id,
            work: Box::pin(work),
            callback,
        }
    }

    /// Complete the job without running it
    pub fn reject(self, err: SessionError) {
        invoke_callback(self.graph_id, self.callback, Err(err));
    }
}

impl std::fmt::Debug for RunJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunJob").field("graph_id", &self.graph_id).finish()
    }
}

/// Invoke a completion callback, containing any panic it raises
pub fn invoke_callback(graph_id: u32, callback: RunCallback, result: Result<RunOutput>) {
    if catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        error!(graph_id, "Run completion callback panicked");
    }
}

/// Ordered queue of runs served by one background task
pub struct RunWorker {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<RunJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RunWorker {
    /// Spawn the worker task on the current runtime
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<RunJob>();

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!(worker = %task_name, "Run worker started");
            while let Some(job) = receiver.recv().await {
                let RunJob {
                    graph_id,
                    work,
                    callback,
                } = job;

                // A panicking run must still complete its callback.
                let result = match tokio::spawn(work).await {
                    Ok(result) => result,
                    Err(e) => Err(SessionError::internal(format!(
                        "run of graph {} aborted: {}",
                        graph_id, e
                    ))),
                };
                invoke_callback(graph_id, callback, result);
            }
            debug!(worker = %task_name, "Run worker stopped");
        });

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. A closed worker hands the job back.
    pub fn submit(&self, job: RunJob) -> std::result::Result<(), RunJob> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().as_ref().map_or(true, |s| s.is_closed())
    }

    /// Stop accepting jobs and wait until every queued job has completed
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(worker = %self.name, error = %e, "Run worker terminated abnormally");
            }
        }
    }
}

impl std::fmt::Debug for RunWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWorker")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording_callback(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> RunCallback {
        let log = log.clone();
        Box::new(move |result: Result<RunOutput>| {
            let entry = match result {
                Ok(_) => format!("{} ok", tag),
                Err(e) => format!("{} err {:?}", tag, e.kind()),
            };
            log.lock().push(entry);
        })
    }

    #[tokio::test]
    async fn test_jobs_complete_in_submission_order() {
        let worker = RunWorker::spawn("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let job = RunJob::new(
                1,
                async { Ok::<_, SessionError>(RunOutput::success(Vec::new())) },
                recording_callback(&log, tag),
            );
            worker.submit(job).unwrap();
        }

        worker.shutdown().await;
        assert_eq!(*log.lock(), vec!["a ok", "b ok", "c ok"]);
    }

    async fn explode() -> Result<RunOutput> {
        panic!("kernel exploded")
    }

    #[tokio::test]
    async fn test_panicking_work_still_completes() {
        let worker = RunWorker::spawn("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let job = RunJob::new(3, explode(), recording_callback(&log, "boom"));
        worker.submit(job).unwrap();

        worker.shutdown().await;
        assert_eq!(*log.lock(), vec!["boom err Internal"]);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_returns_job() {
        let worker = RunWorker::spawn("test");
        worker.shutdown().await;
        assert!(worker.is_closed());

        let log = Arc::new(Mutex::new(Vec::new()));
        let job = RunJob::new(
            1,
            async { Ok::<_, SessionError>(RunOutput::end_of_sequence()) },
            recording_callback(&log, "late"),
        );
        let job = worker.submit(job).unwrap_err();
        job.reject(SessionError::NotInitialized(1));
        assert_eq!(*log.lock(), vec!["late err NotInitialized"]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        invoke_callback(1, Box::new(|_| panic!("user callback")), Ok(RunOutput::end_of_sequence()));
    }
}

//! Serialized job queue
//!
//! Every mutation of the packet filter, the store and the zone runs on a
//! single worker task, one job at a time, in submission order. Jobs may
//! carry a deduplication id: while a job with that id is waiting, further
//! submissions with the same id are dropped. The id is released when the
//! job *starts*, so a change arriving while it runs queues a fresh pass.
//!
//! A failing or panicking job is logged and the worker moves on.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

type JobFuture = Pin<Box<dyn Future<Output = Option<String>> + Send>>;

struct QueuedJob {
    id: Option<String>,
    label: String,
    run: JobFuture,
}

/// Result of [`JobQueue::submit`]
pub enum Submission<T> {
    /// Accepted; the handle yields the job's result
    Queued(JobHandle<T>),
    /// A job with the same id is already waiting
    Duplicate,
    /// The queue has shut down
    Closed,
}

impl<T> Submission<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, Submission::Queued(_))
    }

    pub fn into_handle(self) -> Option<JobHandle<T>> {
        match self {
            Submission::Queued(handle) => Some(handle),
            _ => None,
        }
    }
}

impl<T: Send + 'static> Submission<T> {
    /// Same submission, result reduced to success or failure
    pub fn discard(self) -> Submission<()> {
        match self {
            Submission::Queued(handle) => Submission::Queued(handle.discard()),
            Submission::Duplicate => Submission::Duplicate,
            Submission::Closed => Submission::Closed,
        }
    }
}

/// Completion handle of a queued job
pub struct JobHandle<T> {
    label: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Wait for the job to finish
    ///
    /// A job that panicked reports [`Error::Other`].
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::Other(format!("job {} aborted", self.label)))?
    }
}

impl<T: Send + 'static> JobHandle<T> {
    fn discard(self) -> JobHandle<()> {
        let (tx, rx) = oneshot::channel();
        let label = self.label.clone();
        tokio::spawn(async move {
            let _ = tx.send(self.wait().await.map(drop));
        });
        JobHandle { label, rx }
    }
}

#[derive(Default)]
struct Pending(Mutex<HashSet<String>>);

impl Pending {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single-worker FIFO queue with id-based deduplication
pub struct JobQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl JobQueue {
    /// Start the worker; must be called inside a tokio runtime
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending::default());
        let worker = tokio::spawn(Self::work(rx, pending.clone()));

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
        }
    }

    async fn work(mut rx: mpsc::UnboundedReceiver<QueuedJob>, pending: Arc<Pending>) {
        while let Some(job) = rx.recv().await {
            if let Some(id) = &job.id {
                pending.lock().remove(id);
            }
            debug!("Running job {}", job.label);

            match tokio::spawn(job.run).await {
                Ok(None) => debug!("Job {} finished", job.label),
                Ok(Some(err)) => error!("Job {} failed: {}", job.label, err),
                Err(e) => error!("Job {} panicked: {}", job.label, e),
            }
        }
        debug!("Job queue worker exiting");
    }

    /// Queue a job
    ///
    /// # Parameters
    ///
    /// - `id`: deduplication id; `None` always queues
    /// - `label`: name used in logs
    /// - `job`: the work; not polled until the worker reaches it
    pub fn submit<T, F>(&self, id: Option<&str>, label: impl Into<String>, job: F) -> Submission<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let label = label.into();
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = tx.as_ref() else {
            debug!("Queue closed, rejecting job {}", label);
            return Submission::Closed;
        };

        // hold the pending lock across the send so the worker cannot
        // start the job before its id is recorded
        let mut pending = self.pending.lock();
        if let Some(id) = id {
            if pending.contains(id) {
                debug!("Job {} already pending, skipping", id);
                return Submission::Duplicate;
            }
            pending.insert(id.to_string());
        }

        let (done_tx, done_rx) = oneshot::channel();
        let run: JobFuture = Box::pin(async move {
            let outcome = job.await;
            let failure = outcome.as_ref().err().map(|e| e.to_string());
            let _ = done_tx.send(outcome);
            failure
        });
        let queued = QueuedJob {
            id: id.map(str::to_string),
            label: label.clone(),
            run,
        };

        if sender.send(queued).is_err() {
            if let Some(id) = id {
                pending.remove(id);
            }
            return Submission::Closed;
        }
        Submission::Queued(JobHandle { label, rx: done_rx })
    }

    /// Ids of jobs waiting to start
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.pending.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Stop accepting jobs, run everything already queued, join the worker
    pub async fn shutdown(&self) {
        let sender = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Job queue worker terminated abnormally: {}", e);
            }
        }
        info!("Job queue drained");
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

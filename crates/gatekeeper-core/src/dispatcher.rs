//! Job dispatcher: a single serialized worker draining an mpsc channel,
//! coalescing repeated jobs for the same key, with a `TimerJob` backstop
//! that re-checks every open pull request on an interval independent of
//! webhook delivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::errors::GateError;

/// One unit of work. `PullRequestJob` and `CommitJob` re-run gating from
/// scratch for the affected PR(s); `TimerJob` sweeps everything open as a
/// backstop for missed webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Job {
    PullRequestJob(u64),
    CommitJob(String),
    TimerJob,
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Self::PullRequestJob(_) => "pull_request",
            Self::CommitJob(_) => "commit",
            Self::TimerJob => "timer",
        }
    }

    fn key(&self) -> String {
        match self {
            Self::PullRequestJob(id) => id.to_string(),
            Self::CommitJob(sha) => sha.clone(),
            Self::TimerJob => "timer".to_string(),
        }
    }
}

/// Retry policy for transient host/git errors: exponential backoff from a
/// 1s base, capped per-attempt at 5 minutes, with a total
/// retry budget of 1 hour before the job is promoted to [`GateError::Fatal`].
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const RETRY_BUDGET: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
struct PendingQueue {
    queue: VecDeque<Job>,
}

impl PendingQueue {
    fn push_coalescing(&mut self, job: Job) {
        if self.queue.contains(&job) {
            return;
        }
        self.queue.push_back(job);
    }
}

pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<Mutex<PendingQueue>>,
}

impl Dispatcher {
    /// Spawns the worker task. `handle` is called once per dequeued job,
    /// after duplicate coalescing; it should re-run gating for the job's
    /// target from scratch, with fully idempotent re-run semantics.
    pub fn spawn<F, Fut>(db: Arc<Db>, handle: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), GateError>> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(Mutex::new(PendingQueue::default()));
        let pending_for_worker = pending.clone();
        let handle = Arc::new(handle);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = pending_for_worker.lock().await;
                    if let Some(pos) = guard.queue.iter().position(|j| j == &job) {
                        guard.queue.remove(pos);
                    }
                }
                run_with_retries(&db, &job, handle.as_ref()).await;
            }
        });

        Self { tx, pending }
    }

    /// Enqueues `job`, dropping it silently if an equal job is already
    /// waiting to run.
    pub async fn enqueue(&self, job: Job) {
        let mut guard = self.pending.lock().await;
        if guard.queue.contains(&job) {
            return;
        }
        guard.push_coalescing(job.clone());
        drop(guard);
        // The channel itself has no duplicate filter; `pending` is the
        // coalescing window between enqueue and the worker picking it up.
        let _ = self.tx.send(job);
    }

    /// Spawns the periodic `TimerJob` backstop.
    pub fn spawn_timer(self: &Arc<Self>, interval: Duration) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                dispatcher.enqueue(Job::TimerJob).await;
            }
        });
    }
}

async fn run_with_retries<F, Fut>(db: &Db, job: &Job, handle: &F)
where
    F: Fn(Job) -> Fut,
    Fut: std::future::Future<Output = Result<(), GateError>>,
{
    let job_row_id = match db.insert_job(job.kind(), &job.key()) {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "failed to record job start; running without a persisted record");
            -1
        }
    };

    let mut attempt: u32 = 0;
    let started = tokio::time::Instant::now();
    loop {
        match handle(job.clone()).await {
            Ok(()) => {
                if job_row_id >= 0 {
                    let _ = db.update_job_status(job_row_id, "succeeded", None);
                }
                return;
            }
            Err(GateError::TransientHost(e)) | Err(GateError::TransientGit(e)) => {
                attempt += 1;
                if job_row_id >= 0 {
                    let _ = db.increment_job_attempt(job_row_id);
                }
                let backoff = BASE_BACKOFF.saturating_mul(2u32.saturating_pow(attempt - 1)).min(MAX_BACKOFF);
                if started.elapsed() + backoff > RETRY_BUDGET {
                    error!(?job, error = %e, "transient error exhausted retry budget, promoting to fatal");
                    if job_row_id >= 0 {
                        let _ = db.update_job_status(job_row_id, "failed", Some(&e.to_string()));
                    }
                    return;
                }
                warn!(?job, attempt, backoff_secs = backoff.as_secs(), error = %e, "transient error, retrying");
                sleep(backoff).await;
            }
            Err(other) => {
                error!(?job, error = %other, "job failed");
                if job_row_id >= 0 {
                    let _ = db.update_job_status(job_row_id, "failed", Some(&other.to_string()));
                }
                return;
            }
        }
    }
}

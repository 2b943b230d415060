//! Worker lane: a serialized, retrying executor for one kind of task.
//!
//! Each lane owns a bounded inbox and a local priority deque (high priority
//! at the front, low at the back) and runs exactly one task at a time on the
//! blocking pool. Failed tasks are re-sent to the lane after a backoff delay
//! so the lane keeps serving other work meanwhile; when retries run out the
//! task is reported back as given up.

mod network_lock;

pub use network_lock::{NetworkLock, NetworkLockGuard};

use crate::retry::{classify, RetryDecision, RetryPolicy, TaskError};
use crate::task::{Task, TaskOutcome};
use crate::upstream::Upstream;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// What a lane tells the result context.
#[derive(Debug)]
pub enum LaneReport {
    Finished {
        task: Task,
        priority: Priority,
        outcome: TaskOutcome,
    },
    /// Retries exhausted (or the item went away); the task is handed back.
    GaveUp {
        task: Task,
        priority: Priority,
        error: TaskError,
    },
    /// Queued low-priority tasks removed by [`WorkerLane::drop_low_priority`].
    Dropped { tasks: Vec<Task> },
}

struct Job {
    task: Task,
    priority: Priority,
    attempt: u32,
}

enum LaneMessage {
    Run(Job),
    DropLowPriority,
}

/// Handle to a running lane. Dropping it stops the lane once its queue is
/// empty.
pub struct WorkerLane {
    name: &'static str,
    tx: mpsc::Sender<LaneMessage>,
    handle: JoinHandle<()>,
}

impl fmt::Debug for WorkerLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLane").field("name", &self.name).finish()
    }
}

/// Settings shared by both lanes.
#[derive(Clone)]
pub struct LaneContext {
    pub upstream: Arc<dyn Upstream>,
    pub policy: RetryPolicy,
    pub network_lock: Arc<NetworkLock>,
    pub chunk_size: u64,
}

impl WorkerLane {
    /// Start a lane on the current tokio runtime. Reports go to `results`.
    pub fn spawn<M>(name: &'static str, ctx: LaneContext, results: mpsc::Sender<M>) -> WorkerLane
    where
        M: From<LaneReport> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let worker = Worker {
            name,
            ctx,
            inbox: rx,
            retry_tx: tx.downgrade(),
            queue: VecDeque::new(),
            results,
        };
        let handle = tokio::spawn(worker.run());
        WorkerLane { name, tx, handle }
    }

    /// Queue a task without waiting. Hands the task back when the inbox is
    /// full or the lane is gone.
    pub fn submit(&self, task: Task, priority: Priority) -> Result<(), Task> {
        let job = Job {
            task,
            priority,
            attempt: 0,
        };
        self.tx.try_send(LaneMessage::Run(job)).map_err(|e| match e.into_inner() {
            LaneMessage::Run(job) => job.task,
            LaneMessage::DropLowPriority => unreachable!("submitted a run message"),
        })
    }

    /// Ask the lane to discard its queued low-priority tasks. Returns false
    /// if the request could not be queued.
    pub fn drop_low_priority(&self) -> bool {
        self.tx.try_send(LaneMessage::DropLowPriority).is_ok()
    }

    /// Stop the lane. Queued and backing-off tasks are discarded; a task
    /// already running on the blocking pool finishes in the background.
    pub async fn shutdown(self) {
        drop(self.tx);
        self.handle.abort();
        let _ = self.handle.await;
        tracing::debug!(lane = self.name, "lane shut down");
    }
}

struct Worker<M> {
    name: &'static str,
    ctx: LaneContext,
    inbox: mpsc::Receiver<LaneMessage>,
    retry_tx: mpsc::WeakSender<LaneMessage>,
    queue: VecDeque<Job>,
    results: mpsc::Sender<M>,
}

impl<M> Worker<M>
where
    M: From<LaneReport> + Send + 'static,
{
    async fn run(mut self) {
        tracing::debug!(lane = self.name, "lane started");
        loop {
            while let Ok(msg) = self.inbox.try_recv() {
                self.accept(msg).await;
            }
            let job = match self.queue.pop_front() {
                Some(job) => job,
                None => match self.inbox.recv().await {
                    Some(msg) => {
                        self.accept(msg).await;
                        continue;
                    }
                    None => break,
                },
            };
            if !self.execute(job).await {
                break;
            }
        }
        tracing::debug!(lane = self.name, "lane stopped");
    }

    async fn accept(&mut self, msg: LaneMessage) {
        match msg {
            LaneMessage::Run(job) => match job.priority {
                Priority::High => self.queue.push_front(job),
                Priority::Low => self.queue.push_back(job),
            },
            LaneMessage::DropLowPriority => {
                let (low, keep): (VecDeque<Job>, VecDeque<Job>) = self
                    .queue
                    .drain(..)
                    .partition(|j| j.priority == Priority::Low);
                self.queue = keep;
                if !low.is_empty() {
                    tracing::debug!(lane = self.name, count = low.len(), "dropped low priority tasks");
                    let tasks = low.into_iter().map(|j| j.task).collect();
                    self.report(LaneReport::Dropped { tasks }).await;
                }
            }
        }
    }

    /// Run one job. Returns false when the result context is gone.
    async fn execute(&mut self, job: Job) -> bool {
        let started = std::time::Instant::now();
        let result = {
            let _guard = self.ctx.network_lock.acquire();
            let upstream = Arc::clone(&self.ctx.upstream);
            let task = job.task.clone();
            let chunk_size = self.ctx.chunk_size;
            tokio::task::spawn_blocking(move || task.execute(upstream.as_ref(), chunk_size))
                .await
                .unwrap_or(Err(TaskError::Aborted))
        };
        tracing::debug!(
            lane = self.name,
            task = ?job.task,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "task done"
        );

        let report = match result {
            Ok(outcome) => LaneReport::Finished {
                task: job.task,
                priority: job.priority,
                outcome,
            },
            Err(error) => {
                tracing::warn!(lane = self.name, task = ?job.task, attempt = job.attempt, "task failed: {}", error);
                match self.retry_later(job, &error) {
                    Ok(()) => return true,
                    Err(job) => {
                        tracing::warn!(lane = self.name, task = ?job.task, "giving up");
                        LaneReport::GaveUp {
                            task: job.task,
                            priority: job.priority,
                            error,
                        }
                    }
                }
            }
        };
        self.report(report).await
    }

    /// Schedule a delayed re-send of `job` if the policy allows; hands the job
    /// back otherwise.
    fn retry_later(&self, job: Job, error: &TaskError) -> Result<(), Job> {
        if !job.task.item().is_available() {
            return Err(job);
        }
        let delay = match self.ctx.policy.decide(job.attempt, classify(error)) {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::GiveUp => return Err(job),
        };
        let Some(tx) = self.retry_tx.upgrade() else {
            return Err(job);
        };
        tracing::debug!(lane = self.name, task = ?job.task, ?delay, "retrying");
        let next = Job {
            attempt: job.attempt + 1,
            ..job
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LaneMessage::Run(next)).await;
        });
        Ok(())
    }

    async fn report(&self, report: LaneReport) -> bool {
        self.results.send(M::from(report)).await.is_ok()
    }
}

#[cfg(test)]
mod tests;

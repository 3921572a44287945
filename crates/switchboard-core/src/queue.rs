//! Queue bridge.
//!
//! Pulls jobs from an external queue connector and feeds them into the
//! Command Scheduler. A [`Worker`] installed at boot plans each popped job
//! into commands; the bridge counts the outstanding commands per job and
//! only acknowledges the queue once every one of them finished.
//! Acknowledgement is never optimistic: a failing command turns the whole
//! job into a negative acknowledgement, so the connector can retry or
//! dead-letter it.

use std::{
    collections::HashMap,
    fmt,
    time::Duration,
};

use bytes::Bytes;

use crate::command::BoxedCommand;

/// Opaque handle for an external queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    /// Wrap a connector-assigned raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A popped queue job: connector id, a kind for worker routing, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Connector-assigned id, echoed back in the acknowledgement.
    pub id: JobId,
    /// Worker-facing job kind.
    pub kind: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Job {
    /// Build a job.
    pub fn new(id: JobId, kind: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { id, kind: kind.into(), payload: payload.into() }
    }
}

/// One command a job was planned into, optionally delayed.
pub struct Task {
    /// Command to schedule.
    pub command: BoxedCommand,
    /// Schedule via `delay` when set, via `next` otherwise.
    pub after: Option<Duration>,
}

impl Task {
    /// Run on the next tick.
    pub fn now(command: BoxedCommand) -> Self {
        Self { command, after: None }
    }

    /// Run after a delay.
    pub fn after(command: BoxedCommand, delay: Duration) -> Self {
        Self { command, after: Some(delay) }
    }
}

/// Translates popped jobs into commands.
///
/// Implemented for `FnMut(&Job) -> Vec<Task>` closures via the blanket
/// impl. An empty plan acknowledges the job immediately.
pub trait Worker: Send {
    /// Plan the job into zero or more scheduled commands.
    fn plan(&mut self, job: &Job) -> Vec<Task>;
}

impl<F> Worker for F
where
    F: FnMut(&Job) -> Vec<Task> + Send,
{
    fn plan(&mut self, job: &Job) -> Vec<Task> {
        self(job)
    }
}

/// Acknowledgement owed to the queue connector once a job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// All commands completed; the job is processed.
    Ack(JobId),
    /// At least one command failed; the job is not processed.
    Nack {
        /// Job being rejected
        job: JobId,
        /// Aggregated failure reasons
        reason: String,
    },
}

#[derive(Debug)]
struct JobProgress {
    outstanding: usize,
    failures: Vec<String>,
}

/// Tracks in-flight jobs between planning and acknowledgement.
#[derive(Default)]
pub struct QueueBridge {
    worker: Option<Box<dyn Worker>>,
    in_flight: HashMap<JobId, JobProgress>,
}

impl QueueBridge {
    /// Create a bridge with no worker installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the worker that plans jobs. Replaces any previous worker.
    pub fn set_worker(&mut self, worker: Box<dyn Worker>) {
        self.worker = Some(worker);
    }

    /// Whether a worker is installed.
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Plan a job. `None` when no worker is installed (the job must be
    /// negatively acknowledged).
    pub fn plan(&mut self, job: &Job) -> Option<Vec<Task>> {
        self.worker.as_mut().map(|worker| worker.plan(job))
    }

    /// Start tracking a job with `outstanding` scheduled commands.
    pub fn begin(&mut self, job: JobId, outstanding: usize) {
        self.in_flight.insert(job, JobProgress { outstanding, failures: Vec::new() });
    }

    /// Record one command of the job finishing.
    ///
    /// Returns the acknowledgement once the last command completes.
    pub fn complete(&mut self, job: JobId, failure: Option<String>) -> Option<JobOutcome> {
        let progress = self.in_flight.get_mut(&job)?;
        if let Some(reason) = failure {
            progress.failures.push(reason);
        }
        progress.outstanding = progress.outstanding.saturating_sub(1);
        if progress.outstanding > 0 {
            return None;
        }

        let progress = self.in_flight.remove(&job)?;
        if progress.failures.is_empty() {
            Some(JobOutcome::Ack(job))
        } else {
            Some(JobOutcome::Nack { job, reason: progress.failures.join("; ") })
        }
    }

    /// Number of jobs awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl fmt::Debug for QueueBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBridge")
            .field("worker", &self.worker.is_some())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::from_fn;

    fn job(raw: u64) -> Job {
        Job::new(JobId::new(raw), "test", "payload")
    }

    #[test]
    fn no_worker_means_no_plan() {
        let mut bridge = QueueBridge::new();
        assert!(bridge.plan(&job(1)).is_none());
    }

    #[test]
    fn ack_only_after_every_command_finishes() {
        let mut bridge = QueueBridge::new();
        let id = JobId::new(1);

        bridge.begin(id, 2);
        assert!(bridge.complete(id, None).is_none());
        assert_eq!(bridge.complete(id, None), Some(JobOutcome::Ack(id)));
        assert_eq!(bridge.in_flight(), 0);
    }

    #[test]
    fn any_failure_turns_into_nack() {
        let mut bridge = QueueBridge::new();
        let id = JobId::new(1);

        bridge.begin(id, 2);
        assert!(bridge.complete(id, Some("boom".to_string())).is_none());

        let outcome = bridge.complete(id, None);
        assert_eq!(outcome, Some(JobOutcome::Nack { job: id, reason: "boom".to_string() }));
    }

    #[test]
    fn worker_plans_are_returned() {
        let mut bridge = QueueBridge::new();
        bridge.set_worker(Box::new(|job: &Job| {
            assert_eq!(job.kind, "test");
            vec![Task::now(from_fn(|_ctx| Ok(()))), Task::after(from_fn(|_ctx| Ok(())), Duration::from_millis(5))]
        }));

        let tasks = bridge.plan(&job(1)).map(|t| t.len());
        assert_eq!(tasks, Some(2));
    }

    #[test]
    fn completion_for_unknown_job_is_noop() {
        let mut bridge = QueueBridge::new();
        assert!(bridge.complete(JobId::new(9), None).is_none());
    }
}

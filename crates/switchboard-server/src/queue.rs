//! Queue connector and pump.
//!
//! [`QueueConnector`] is the runtime's edge to an external job queue:
//! pop jobs, acknowledge or reject them. The pump task owns the
//! connector, feeds popped jobs into the control loop as
//! [`Event::JobArrived`], and applies the acknowledgements the core
//! decides on. The core itself never acknowledges optimistically - the
//! pump only relays its verdicts.

use async_trait::async_trait;
use switchboard_core::{Event, Job, JobId, JobOutcome};
use tokio::sync::mpsc;

use crate::LoopEvent;

/// Edge to an external job queue.
///
/// `pop` must be cancel-safe: the pump races it against acknowledgement
/// commands in a `select!`.
#[async_trait]
pub trait QueueConnector: Send {
    /// Wait for the next job. `None` ends the pump (queue closed).
    async fn pop(&mut self) -> Option<Job>;

    /// The job completed; remove it from the queue.
    async fn ack(&mut self, job: JobId);

    /// The job failed; the queue may retry or dead-letter it.
    async fn nack(&mut self, job: JobId, reason: &str);
}

/// Acknowledgement relayed from the control loop to the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCommand {
    /// Acknowledge a processed job.
    Ack(JobId),
    /// Reject a failed job.
    Nack {
        /// Rejected job
        job: JobId,
        /// Failure reasons
        reason: String,
    },
}

/// Start the pump task. Returns the sender the control loop uses to
/// relay acknowledgements.
pub fn spawn_pump(
    mut connector: Box<dyn QueueConnector>,
    events: mpsc::Sender<LoopEvent>,
) -> mpsc::Sender<QueueCommand> {
    let (command_tx, mut command_rx) = mpsc::channel::<QueueCommand>(64);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(QueueCommand::Ack(job)) => connector.ack(job).await,
                    Some(QueueCommand::Nack { job, reason }) => {
                        connector.nack(job, &reason).await;
                    },
                    None => break,
                },
                job = connector.pop() => match job {
                    Some(job) => {
                        if events.send(LoopEvent::Core(Event::JobArrived(job))).await.is_err() {
                            break;
                        }
                    },
                    None => break,
                },
            }
        }
        tracing::debug!("queue pump stopped");
    });
    command_tx
}

/// In-memory queue for tests and demos.
///
/// Jobs are pushed through the paired [`QueueHandle`]; acknowledgements
/// come back out of it as [`JobOutcome`] records.
pub struct InMemoryQueue {
    jobs: mpsc::Receiver<Job>,
    outcomes: mpsc::UnboundedSender<JobOutcome>,
}

/// Test-side handle of an [`InMemoryQueue`].
pub struct QueueHandle {
    /// Push jobs into the queue.
    pub jobs: mpsc::Sender<Job>,
    /// Observe acknowledgements in order.
    pub outcomes: mpsc::UnboundedReceiver<JobOutcome>,
}

/// Create a paired in-memory queue and its handle.
pub fn in_memory(capacity: usize) -> (InMemoryQueue, QueueHandle) {
    let (job_tx, job_rx) = mpsc::channel(capacity);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    (
        InMemoryQueue { jobs: job_rx, outcomes: outcome_tx },
        QueueHandle { jobs: job_tx, outcomes: outcome_rx },
    )
}

#[async_trait]
impl QueueConnector for InMemoryQueue {
    async fn pop(&mut self) -> Option<Job> {
        self.jobs.recv().await
    }

    async fn ack(&mut self, job: JobId) {
        let _ = self.outcomes.send(JobOutcome::Ack(job));
    }

    async fn nack(&mut self, job: JobId, reason: &str) {
        let _ = self.outcomes.send(JobOutcome::Nack { job, reason: reason.to_string() });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn pump_relays_jobs_and_acknowledgements() {
        let (queue, mut handle) = in_memory(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let commands = spawn_pump(Box::new(queue), events_tx);

        let job = Job::new(JobId::new(1), "resize", "image-bytes");
        handle.jobs.send(job.clone()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            LoopEvent::Core(Event::JobArrived(arrived)) if arrived == job
        ));

        commands.send(QueueCommand::Ack(JobId::new(1))).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), handle.outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, JobOutcome::Ack(JobId::new(1)));
    }

    #[tokio::test]
    async fn pump_relays_nacks_with_reason() {
        let (queue, mut handle) = in_memory(8);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let commands = spawn_pump(Box::new(queue), events_tx);

        commands
            .send(QueueCommand::Nack { job: JobId::new(2), reason: "boom".to_string() })
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle.outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, JobOutcome::Nack { job: JobId::new(2), reason: "boom".to_string() });
    }
}

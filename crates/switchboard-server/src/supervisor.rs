//! External process host.
//!
//! Executes the supervisor half the core cannot: real spawns via
//! `tokio::process`, termination signals, and pipe links as forwarding
//! tasks. Every outcome re-enters the control loop as an event - the host
//! never mutates core state directly.
//!
//! Children are spawned with piped stdio so their streams can be claimed
//! later by a pipe link. A pipe is a `tokio::io::copy` task from the
//! source's stdout into the sink's stdin; when the source exits, the
//! writer drops and EOF propagates to the sink without terminating it.

use std::{collections::HashMap, process::Stdio};

use switchboard_core::{Event, ProcessId, ProcessSpec};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
};

use crate::LoopEvent;

struct ChildHandle {
    kill: Option<oneshot::Sender<()>>,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

/// Spawns and tracks child processes on behalf of the control loop.
pub struct ProcessHost {
    events: mpsc::Sender<LoopEvent>,
    children: HashMap<ProcessId, ChildHandle>,
}

impl ProcessHost {
    /// Create a host posting process events into the given channel.
    pub fn new(events: mpsc::Sender<LoopEvent>) -> Self {
        Self { events, children: HashMap::new() }
    }

    /// Spawn a child for `process`. Posts `ProcessSpawned` on success or
    /// `ProcessSpawnFailed` on failure, then `ProcessExited` when the
    /// child finishes.
    ///
    /// All events are posted from spawned tasks: this method is called by
    /// the task that drains the event channel, so it must never await
    /// capacity on it.
    pub fn spawn(&mut self, process: ProcessId, spec: &ProcessSpec) {
        let mut child = match Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let events = self.events.clone();
                let reason = err.to_string();
                tokio::spawn(async move {
                    let event = Event::ProcessSpawnFailed { process, reason };
                    let _ = events.send(LoopEvent::Core(event)).await;
                });
                return;
            },
        };

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.children
            .insert(process, ChildHandle { kill: Some(kill_tx), stdout, stdin });

        // One task posts both events so the exit can never overtake the
        // spawn confirmation.
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(LoopEvent::Core(Event::ProcessSpawned(process))).await;
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|s| s.code())
                },
            };
            let _ = events.send(LoopEvent::Core(Event::ProcessExited { process, code })).await;
        });
    }

    /// Deliver a termination signal. The exit is confirmed by the wait
    /// task's `ProcessExited` event, never synchronously.
    pub fn signal(&mut self, process: ProcessId) {
        if let Some(handle) = self.children.get_mut(&process) {
            if let Some(kill) = handle.kill.take() {
                let _ = kill.send(());
            }
        } else {
            tracing::debug!(%process, "signal for unknown child");
        }
    }

    /// Link `from`'s stdout into `to`'s stdin with a forwarding task.
    ///
    /// Each stream can be claimed once; a second pipe on the same stream
    /// is reported and ignored.
    pub fn pipe(&mut self, from: ProcessId, to: ProcessId) {
        let stdout = self.children.get_mut(&from).and_then(|handle| handle.stdout.take());
        let stdin = self.children.get_mut(&to).and_then(|handle| handle.stdin.take());

        let (Some(mut stdout), Some(mut stdin)) = (stdout, stdin) else {
            tracing::warn!(%from, %to, "pipe streams unavailable (missing child or already claimed)");
            return;
        };

        tokio::spawn(async move {
            match tokio::io::copy(&mut stdout, &mut stdin).await {
                Ok(bytes) => tracing::debug!(%from, %to, bytes, "pipe drained"),
                Err(err) => tracing::debug!(%from, %to, %err, "pipe ended with error"),
            }
            // stdin drops here; the sink sees EOF.
        });
    }

    /// Forget an exited child. Unclaimed stdout is drained in the
    /// background and logged line by line, so child output is never lost
    /// silently.
    pub fn reap(&mut self, process: ProcessId) {
        let Some(handle) = self.children.remove(&process) else {
            return;
        };
        if let Some(stdout) = handle.stdout {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%process, line = %line, "child output");
                }
            });
        }
    }

    /// Number of tracked children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether no children are tracked.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

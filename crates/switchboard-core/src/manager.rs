//! The Manager: single-threaded orchestration core.
//!
//! Composes the connection and topic registries, timer wheel, command
//! scheduler, listener registry, process table, promise resolver, and
//! queue bridge behind one event-driven state machine. The Manager never
//! performs I/O: the runtime feeds it [`Event`]s (plus the current time)
//! and executes the [`Action`]s it returns. All state lives on one thread;
//! external threads communicate exclusively by posting events.
//!
//! Failure isolation: anything local to a single connection, command,
//! process, or queue job is reported through [`Action::Log`] (or a queue
//! negative-acknowledgement) and never aborts sibling work. Only lifecycle
//! misuse surfaces as `Err` from [`Manager::handle`].

use std::{
    fmt,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    command::{BoxedCommand, CommandCtx, CommandId, CommandScheduler, Scheduled},
    connection::{ConnectionId, ConnectionRegistry},
    error::{CommandError, ManagerError},
    listener::{Listener, ListenerId, ListenerRegistry},
    message::Message,
    process::{ProcessId, ProcessSpec, ProcessState, ProcessTable},
    promise::{Continuation, PromiseId, PromiseResolver},
    queue::{Job, JobId, JobOutcome, QueueBridge, Worker},
    timer::{TimerId, TimerWheel},
    topic::TopicRegistry,
};

/// Manager lifecycle states. Transitions are strictly forward:
/// uninitialized -> booted -> started -> stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, registries not yet initialized.
    Uninitialized,
    /// Booted: workers and listeners may be installed, events not yet
    /// accepted.
    Booted,
    /// Serving events.
    Started,
    /// Drained and shut down. Terminal.
    Stopped,
}

/// Severity of a log entry emitted through the action channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Fine-grained diagnostics.
    Debug,
    /// Normal operational messages.
    Info,
    /// Recoverable anomalies (closed send targets, unknown ids).
    Warn,
    /// Failures that were isolated but lost work (failed commands).
    Error,
}

/// Inputs to [`Manager::handle`], posted by the runtime.
#[derive(Debug)]
pub enum Event {
    /// Transport accepted a new connection.
    Opened(ConnectionId),
    /// A framed message arrived on a connection.
    Received {
        /// Source connection
        connection: ConnectionId,
        /// Decoded message
        message: Message,
    },
    /// The peer closed the connection (transport already gone).
    Closed(ConnectionId),
    /// Transport error on one connection.
    Faulted {
        /// Offending connection
        connection: ConnectionId,
        /// Transport-reported reason
        reason: String,
    },
    /// Control-loop tick: fire due timers and scheduled commands.
    Tick,
    /// The runtime confirmed a requested spawn.
    ProcessSpawned(ProcessId),
    /// The runtime failed to spawn a requested process.
    ProcessSpawnFailed {
        /// Process that failed to spawn
        process: ProcessId,
        /// Launcher error
        reason: String,
    },
    /// A supervised process exited.
    ProcessExited {
        /// Process that exited
        process: ProcessId,
        /// Exit code, if the platform reported one
        code: Option<i32>,
    },
    /// The queue connector popped a job.
    JobArrived(Job),
}

/// Side effects for the runtime to execute after a `handle` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write a message to a connection.
    Send {
        /// Target connection
        connection: ConnectionId,
        /// Message to frame and write
        message: Message,
    },
    /// Close a connection's transport.
    Close {
        /// Connection to close
        connection: ConnectionId,
        /// Human-readable reason
        reason: String,
    },
    /// Spawn an external process.
    Spawn {
        /// Supervisor handle for the process
        process: ProcessId,
        /// Program and arguments
        spec: ProcessSpec,
    },
    /// Signal a process to terminate.
    Signal {
        /// Process to signal
        process: ProcessId,
    },
    /// Forward `from`'s output stream into `to`'s input stream.
    Pipe {
        /// Stream source
        from: ProcessId,
        /// Stream sink
        to: ProcessId,
    },
    /// Acknowledge a fully-processed queue job.
    AckJob(JobId),
    /// Reject a queue job.
    NackJob {
        /// Rejected job
        job: JobId,
        /// Aggregated failure reasons
        reason: String,
    },
    /// Emit a log entry.
    Log {
        /// Severity
        level: LogLevel,
        /// Log message
        message: String,
    },
}

/// Tunables for the Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Open-connection cap; further opens are refused with a close.
    pub max_connections: usize,
    /// Maximum queued commands executed while draining in `stop`.
    pub drain_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { max_connections: 10_000, drain_limit: 1024 }
    }
}

/// Handle returned by `execute`: the process id plus the promise settled
/// when the process exits (or its spawn fails).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Supervisor id of the process.
    pub id: ProcessId,
    /// Settled with the exit code string, `None` on spawn failure or
    /// codeless exit.
    pub exited: PromiseId,
}

/// The orchestration core.
pub struct Manager {
    config: ManagerConfig,
    lifecycle: Lifecycle,
    connections: ConnectionRegistry,
    topics: TopicRegistry,
    timers: TimerWheel,
    commands: CommandScheduler,
    listeners: ListenerRegistry,
    processes: ProcessTable,
    promises: PromiseResolver,
    queue: QueueBridge,
}

impl Manager {
    /// Create a Manager in the uninitialized state.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::Uninitialized,
            connections: ConnectionRegistry::new(),
            topics: TopicRegistry::new(),
            timers: TimerWheel::new(),
            commands: CommandScheduler::new(),
            listeners: ListenerRegistry::new(),
            processes: ProcessTable::new(),
            promises: PromiseResolver::new(),
            queue: QueueBridge::new(),
        }
    }

    // ---- lifecycle ----

    /// Initialize the Manager. Must be called exactly once, before
    /// anything else.
    pub fn boot(&mut self) -> Result<Vec<Action>, ManagerError> {
        self.require(Lifecycle::Uninitialized, "boot")?;
        self.lifecycle = Lifecycle::Booted;
        Ok(vec![Self::log(LogLevel::Info, "manager booted")])
    }

    /// Begin accepting events.
    pub fn start(&mut self) -> Result<Vec<Action>, ManagerError> {
        self.require(Lifecycle::Booted, "start")?;
        self.lifecycle = Lifecycle::Started;
        Ok(vec![Self::log(LogLevel::Info, "manager started")])
    }

    /// Shut down: drain queued commands (up to the configured limit),
    /// signal every live process, close every connection.
    ///
    /// Delayed commands and timers that are not yet due are dropped, not
    /// promoted.
    pub fn stop(&mut self, now: Instant) -> Result<Vec<Action>, ManagerError> {
        self.require(Lifecycle::Started, "stop")?;

        let mut actions = Vec::new();
        let mut drained = 0usize;
        loop {
            let batch = self.commands.take_queued();
            if batch.is_empty() {
                break;
            }
            for scheduled in batch {
                if drained >= self.config.drain_limit {
                    actions.push(Self::log(
                        LogLevel::Warn,
                        format!("drain limit reached, dropping {}", scheduled.id),
                    ));
                    continue;
                }
                drained += 1;
                self.execute_scheduled(scheduled, now, &mut actions);
            }
        }
        self.commands.finish_batch();
        let dropped = self.commands.pending();
        if dropped > 0 {
            actions.push(Self::log(
                LogLevel::Info,
                format!("dropping {dropped} not-yet-due delayed commands"),
            ));
            self.commands.clear();
        }

        for process in self.processes.live_ids() {
            if self.processes.begin_terminate(process) {
                actions.push(Action::Signal { process });
            }
        }

        for connection in self.connections.drain() {
            self.topics.drop_connection(connection);
            actions.push(Action::Close {
                connection,
                reason: "server stopping".to_string(),
            });
        }

        self.timers.clear();
        self.lifecycle = Lifecycle::Stopped;
        actions.push(Self::log(
            LogLevel::Info,
            format!("manager stopped after draining {drained} commands"),
        ));
        Ok(actions)
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn require(&self, expected: Lifecycle, operation: &'static str) -> Result<(), ManagerError> {
        if self.lifecycle == expected {
            Ok(())
        } else {
            Err(ManagerError::Lifecycle { state: self.lifecycle, operation })
        }
    }

    fn log(level: LogLevel, message: impl Into<String>) -> Action {
        Action::Log { level, message: message.into() }
    }

    // ---- event entry point ----

    /// Process one event, returning the side effects to execute.
    ///
    /// Only accepted while started; events arriving in any other state are
    /// a runtime bug and rejected with a lifecycle error.
    pub fn handle(&mut self, event: Event, now: Instant) -> Result<Vec<Action>, ManagerError> {
        self.require(Lifecycle::Started, "handle")?;
        let actions = match event {
            Event::Opened(connection) => self.open(connection),
            Event::Received { connection, message } => self.dispatch(connection, &message),
            Event::Closed(connection) => self.handle_closed(connection),
            Event::Faulted { connection, reason } => self.error(connection, &reason),
            Event::Tick => self.handle_tick(now),
            Event::ProcessSpawned(process) => self.handle_spawned(process),
            Event::ProcessSpawnFailed { process, reason } => {
                self.handle_spawn_failed(process, reason)
            },
            Event::ProcessExited { process, code } => self.handle_exited(process, code),
            Event::JobArrived(job) => self.handle_job(job, now),
        };
        Ok(actions)
    }

    // ---- connections ----

    /// Admit a connection. Idempotent; over-limit opens are refused with a
    /// close action.
    pub fn open(&mut self, connection: ConnectionId) -> Vec<Action> {
        if !self.connections.is_open(connection)
            && self.connections.len() >= self.config.max_connections
        {
            return vec![
                Self::log(
                    LogLevel::Warn,
                    format!("refusing {connection}: connection limit reached"),
                ),
                Action::Close { connection, reason: "connection limit reached".to_string() },
            ];
        }
        if self.connections.open(connection) {
            vec![Self::log(LogLevel::Info, format!("{connection} opened"))]
        } else {
            vec![Self::log(LogLevel::Debug, format!("{connection} already open"))]
        }
    }

    /// Close a connection and cascade its unsubscriptions, atomically with
    /// respect to the tick: the connection vanishes from every subscriber
    /// set before the next broadcast evaluates.
    pub fn close(&mut self, connection: ConnectionId, reason: &str) -> Vec<Action> {
        if !self.connections.close(connection) {
            return vec![Self::log(
                LogLevel::Debug,
                format!("close for {connection} which is not open"),
            )];
        }
        let topics = self.topics.drop_connection(connection);
        vec![
            Self::log(
                LogLevel::Info,
                format!("{connection} closed ({reason}), left {} topics", topics.len()),
            ),
            Action::Close { connection, reason: reason.to_string() },
        ]
    }

    /// Peer-initiated close: same cascade, but the transport is already
    /// gone so no close action is emitted.
    fn handle_closed(&mut self, connection: ConnectionId) -> Vec<Action> {
        if !self.connections.close(connection) {
            return vec![Self::log(
                LogLevel::Debug,
                format!("peer close for unknown {connection}"),
            )];
        }
        self.topics.drop_connection(connection);
        vec![Self::log(LogLevel::Info, format!("{connection} closed by peer"))]
    }

    /// Per-connection failure: close the offender, keep serving everyone
    /// else.
    pub fn error(&mut self, connection: ConnectionId, reason: &str) -> Vec<Action> {
        let mut actions =
            vec![Self::log(LogLevel::Warn, format!("{connection} faulted: {reason}"))];
        actions.extend(self.close(connection, reason));
        actions
    }

    /// Send a message to one connection. A closed target is reported
    /// through the log channel, never raised.
    pub fn send(&mut self, message: &Message, connection: ConnectionId) -> Vec<Action> {
        if self.connections.is_open(connection) {
            vec![Action::Send { connection, message: message.clone() }]
        } else {
            vec![Self::log(
                LogLevel::Warn,
                format!("dropping send: {}", ManagerError::ConnectionClosed(connection)),
            )]
        }
    }

    /// Send a final message, then close the connection unconditionally.
    pub fn end(&mut self, message: &Message, connection: ConnectionId) -> Vec<Action> {
        let mut actions = self.send(message, connection);
        actions.extend(self.close(connection, "ended"));
        actions
    }

    /// Broadcast to an explicit set, or to every open connection.
    ///
    /// Closed targets never abort the sweep; they are collected and
    /// reported once afterwards.
    pub fn broadcast(
        &mut self,
        message: &Message,
        targets: Option<&[ConnectionId]>,
    ) -> Vec<Action> {
        let targets: Vec<ConnectionId> = match targets {
            Some(explicit) => explicit.to_vec(),
            None => {
                let mut all: Vec<ConnectionId> = self.connections.iter().collect();
                all.sort_unstable();
                all
            },
        };

        let mut actions = Vec::new();
        let mut skipped = Vec::new();
        for connection in targets {
            if self.connections.is_open(connection) {
                actions.push(Action::Send { connection, message: message.clone() });
            } else {
                skipped.push(connection);
            }
        }
        if !skipped.is_empty() {
            let list: Vec<String> = skipped.iter().map(ToString::to_string).collect();
            actions.push(Self::log(
                LogLevel::Warn,
                format!("broadcast skipped closed targets: {}", list.join(", ")),
            ));
        }
        actions
    }

    // ---- topics ----

    /// Register a topic. No-op if already registered.
    pub fn register(&mut self, topic: &str) -> Vec<Action> {
        if self.topics.register(topic) {
            vec![Self::log(LogLevel::Info, format!("topic {topic:?} registered"))]
        } else {
            vec![Self::log(LogLevel::Debug, format!("topic {topic:?} already registered"))]
        }
    }

    /// Unregister a topic. Subscribers are dropped but stay connected.
    pub fn unregister(&mut self, topic: &str) -> Vec<Action> {
        match self.topics.unregister(topic) {
            Some(dropped) => vec![Self::log(
                LogLevel::Info,
                format!("topic {topic:?} unregistered, {} subscribers dropped", dropped.len()),
            )],
            None => {
                vec![Self::log(LogLevel::Debug, format!("unregister of unknown topic {topic:?}"))]
            },
        }
    }

    /// Subscribe a connection to a registered topic.
    ///
    /// Errors on unregistered topics and on connections that are not open.
    pub fn subscribe(
        &mut self,
        topic: &str,
        connection: ConnectionId,
    ) -> Result<(), ManagerError> {
        if !self.connections.is_open(connection) {
            return Err(ManagerError::ConnectionClosed(connection));
        }
        self.topics.subscribe(topic, connection)?;
        Ok(())
    }

    /// Unsubscribe. No-op if the pair does not exist.
    pub fn unsubscribe(&mut self, topic: &str, connection: ConnectionId) -> bool {
        self.topics.unsubscribe(topic, connection)
    }

    /// Broadcast to a topic's subscribers, evaluated now - not at
    /// registration time. Errors on unregistered topics.
    pub fn publish(
        &mut self,
        topic: &str,
        message: &Message,
    ) -> Result<Vec<Action>, ManagerError> {
        let mut subscribers = self.topics.subscribers(topic)?;
        subscribers.sort_unstable();
        Ok(self.broadcast(message, Some(&subscribers)))
    }

    // ---- commands ----

    /// Run a command synchronously, returning the actions it produced.
    ///
    /// Failures propagate to the caller and discard the partial action
    /// batch; use `next` for work whose effects must survive its own
    /// failure handling. Permitted while booted (setup wiring) or started.
    pub fn run(&mut self, command: BoxedCommand, now: Instant) -> Result<Vec<Action>, CommandError> {
        if !matches!(self.lifecycle, Lifecycle::Booted | Lifecycle::Started) {
            return Err(ManagerError::Lifecycle { state: self.lifecycle, operation: "run" }.into());
        }
        let mut actions = Vec::new();
        self.run_inner(command, now, &mut actions)?;
        Ok(actions)
    }

    /// Execute a command against this Manager, appending its actions to an
    /// existing batch. Used by `run` and by commands calling `run` on their
    /// own context.
    pub(crate) fn run_inner(
        &mut self,
        mut command: BoxedCommand,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), CommandError> {
        let mut ctx = CommandCtx::new(self, now, actions);
        command.execute(&mut ctx)
    }

    /// Schedule a command for the start of the next tick.
    pub fn next(&mut self, command: BoxedCommand) -> CommandId {
        self.commands.next(command, None)
    }

    /// Schedule a command to run once `after` has elapsed.
    pub fn delay(&mut self, command: BoxedCommand, after: Duration, now: Instant) -> CommandId {
        self.commands.delay(command, after, now, None)
    }

    /// Cancel a scheduled command. No-op once it started or completed.
    pub fn abort(&mut self, command: CommandId) {
        self.commands.abort(command);
    }

    /// Number of commands waiting in the scheduler.
    pub fn pending_commands(&self) -> usize {
        self.commands.pending()
    }

    // ---- timers ----

    /// Add a recurring timer, first firing after `every`.
    pub fn add_timer(&mut self, every: Duration, command: BoxedCommand, now: Instant) -> TimerId {
        self.timers.add(every, command, now)
    }

    /// Add a one-shot timer, auto-removed after firing.
    pub fn once(&mut self, after: Duration, command: BoxedCommand, now: Instant) -> TimerId {
        self.timers.once(after, command, now)
    }

    /// Pause a timer, preserving the remaining interval.
    pub fn pause_timer(&mut self, timer: TimerId, now: Instant) -> bool {
        self.timers.pause(timer, now)
    }

    /// Resume a paused timer from where it left off.
    pub fn resume_timer(&mut self, timer: TimerId, now: Instant) -> bool {
        self.timers.resume(timer, now)
    }

    /// Cancel a timer in any state. Idempotent.
    pub fn cancel_timer(&mut self, timer: TimerId) {
        self.timers.cancel(timer);
    }

    // ---- listeners ----

    /// Install an exact-key listener.
    pub fn listen<F>(&mut self, key: impl Into<String>, factory: F) -> ListenerId
    where
        F: FnMut(&Message) -> BoxedCommand + Send + 'static,
    {
        self.listeners.listen(key, factory)
    }

    /// Install a listener unit directly.
    pub fn add_listener(&mut self, listener: Box<dyn Listener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Remove a listener.
    pub fn silence(&mut self, listener: ListenerId) -> bool {
        self.listeners.silence(listener)
    }

    // ---- processes ----

    /// Request an external process spawn. The process joins the live set
    /// only when the runtime confirms it via [`Event::ProcessSpawned`].
    pub fn execute(&mut self, spec: ProcessSpec) -> (ProcessHandle, Vec<Action>) {
        let exited = self.promises.create();
        let id = self.processes.insert(spec.clone(), exited);
        let actions = vec![
            Self::log(LogLevel::Info, format!("spawn requested: {id} ({})", spec.program)),
            Action::Spawn { process: id, spec },
        ];
        (ProcessHandle { id, exited }, actions)
    }

    /// Signal a live process to terminate. No-op for exited or unknown
    /// processes; removal from the live set waits for the exit event.
    pub fn terminate(&mut self, process: ProcessId) -> Vec<Action> {
        if self.processes.begin_terminate(process) {
            vec![
                Self::log(LogLevel::Info, format!("terminating {process}")),
                Action::Signal { process },
            ]
        } else {
            vec![Self::log(LogLevel::Debug, format!("terminate ignored for {process}"))]
        }
    }

    /// Pipe `input`'s output stream into `output`'s input stream.
    ///
    /// Either process is respawned first if it already exited. Input exit
    /// propagates end-of-stream to the output without terminating it.
    pub fn pipe(
        &mut self,
        input: ProcessId,
        output: ProcessId,
    ) -> Result<Vec<Action>, ManagerError> {
        let mut actions = Vec::new();
        for id in [input, output] {
            match self.processes.state(id) {
                None => return Err(ManagerError::UnknownProcess(id)),
                Some(ProcessState::Exited) => {
                    let exited = self.promises.create();
                    if let Some(spec) = self.processes.respawn(id, exited) {
                        actions.push(Self::log(
                            LogLevel::Info,
                            format!("respawning {id} for pipe"),
                        ));
                        actions.push(Action::Spawn { process: id, spec });
                    }
                },
                Some(_) => {},
            }
        }
        self.processes.link(input, output);
        actions.push(Self::log(LogLevel::Info, format!("piping {input} into {output}")));
        actions.push(Action::Pipe { from: input, to: output });
        Ok(actions)
    }

    /// Number of live (spawned, not yet exited) processes.
    pub fn live_processes(&self) -> usize {
        self.processes.live_count()
    }

    /// Current supervisor state of a process.
    pub fn process_state(&self, process: ProcessId) -> Option<ProcessState> {
        self.processes.state(process)
    }

    // ---- promises ----

    /// Create an unsettled promise.
    pub fn new_promise(&mut self) -> PromiseId {
        self.promises.create()
    }

    /// Settle a promise, at most once. Continuations registered on it are
    /// scheduled for the next tick; repeat settlements are no-ops.
    pub fn resolve(&mut self, promise: PromiseId, value: Option<Bytes>) {
        for command in self.promises.resolve(promise, value) {
            self.commands.next(command, None);
        }
    }

    /// Register a continuation. If the promise already settled, the
    /// continuation is scheduled immediately with the stored value.
    pub fn on_settled(&mut self, promise: PromiseId, continuation: Box<dyn Continuation>) {
        if let Some(command) = self.promises.on_settled(promise, continuation) {
            self.commands.next(command, None);
        }
    }

    /// Whether the promise has settled.
    pub fn is_settled(&self, promise: PromiseId) -> bool {
        self.promises.is_settled(promise)
    }

    /// Settled value of a promise, `None` if unsettled.
    pub fn settled_value(&self, promise: PromiseId) -> Option<Option<Bytes>> {
        self.promises.settled_value(promise)
    }

    // ---- queue ----

    /// Install the worker that plans queue jobs. Typically called while
    /// booted, before the connector pump starts.
    pub fn set_worker(&mut self, worker: Box<dyn Worker>) {
        self.queue.set_worker(worker);
    }

    /// Jobs planned but not yet acknowledged.
    pub fn jobs_in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    // ---- introspection ----

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a connection is open.
    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.connections.is_open(connection)
    }

    /// Whether a topic is registered.
    pub fn is_registered(&self, topic: &str) -> bool {
        self.topics.is_registered(topic)
    }

    /// Whether a connection is subscribed to a topic.
    pub fn is_subscribed(&self, topic: &str, connection: ConnectionId) -> bool {
        self.topics.is_subscribed(topic, connection)
    }

    /// Number of subscribers of a topic. Zero for unknown topics.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.subscriber_count(topic)
    }

    /// Number of live timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // ---- event handlers ----

    /// One tick: fire due timers, then execute the command batch that was
    /// ready when the tick began. Commands enqueued mid-tick (by timers or
    /// by other commands) run on the following tick.
    fn handle_tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        // Snapshot before timers run, so their `next` submissions wait a tick.
        let batch = self.commands.take_ready(now);
        self.fire_due_timers(now, &mut actions);
        for scheduled in batch {
            self.execute_scheduled(scheduled, now, &mut actions);
        }
        self.commands.finish_batch();
        actions
    }

    fn fire_due_timers(&mut self, now: Instant, actions: &mut Vec<Action>) {
        for (id, mut entry) in self.timers.take_due(now) {
            if !self.timers.begin_fire(id) {
                // Cancelled by an earlier callback in this sweep.
                actions.push(Self::log(LogLevel::Debug, format!("{id} cancelled before firing")));
                self.timers.finish_fire(id, entry, now);
                continue;
            }
            let result = {
                let mut ctx = CommandCtx::new(self, now, actions);
                entry.command.execute(&mut ctx)
            };
            if let Err(err) = result {
                actions.push(Self::log(LogLevel::Error, format!("{id} callback failed: {err}")));
            }
            self.timers.finish_fire(id, entry, now);
        }
    }

    /// Execute one scheduled command. Failures are logged, never
    /// propagated; a job-tagged command additionally reports completion to
    /// the queue bridge, which acknowledges once the job's last command
    /// finishes.
    ///
    /// An entry aborted after the batch was taken (by an earlier sibling)
    /// is skipped; a job-tagged skip counts as a failed completion so the
    /// job is rejected rather than left in flight.
    fn execute_scheduled(&mut self, scheduled: Scheduled, now: Instant, actions: &mut Vec<Action>) {
        let Scheduled { id, mut command, job } = scheduled;
        if !self.commands.start(id) {
            actions.push(Self::log(LogLevel::Debug, format!("{id} aborted before starting")));
            if let Some(job) = job {
                self.complete_job(job, Some("aborted".to_string()), actions);
            }
            return;
        }
        let result = {
            let mut ctx = CommandCtx::new(self, now, actions);
            command.execute(&mut ctx)
        };
        let failure = match result {
            Ok(()) => None,
            Err(err) => {
                actions.push(Self::log(LogLevel::Error, format!("{id} failed: {err}")));
                Some(err.to_string())
            },
        };
        if let Some(job) = job {
            self.complete_job(job, failure, actions);
        }
    }

    fn complete_job(&mut self, job: JobId, failure: Option<String>, actions: &mut Vec<Action>) {
        match self.queue.complete(job, failure) {
            Some(JobOutcome::Ack(job)) => actions.push(Action::AckJob(job)),
            Some(JobOutcome::Nack { job, reason }) => {
                actions.push(Action::NackJob { job, reason });
            },
            None => {},
        }
    }

    /// Route a received message through the listener registry. Matching
    /// listeners only schedule commands (via `next`); reception is never
    /// blocked by command execution.
    fn dispatch(&mut self, connection: ConnectionId, message: &Message) -> Vec<Action> {
        let commands = self.listeners.dispatch(message);
        if commands.is_empty() {
            return vec![Self::log(
                LogLevel::Debug,
                format!("no listener for key {:?} from {connection}", message.key),
            )];
        }
        for command in commands {
            self.commands.next(command, None);
        }
        Vec::new()
    }

    fn handle_spawned(&mut self, process: ProcessId) -> Vec<Action> {
        if self.processes.mark_running(process) {
            vec![Self::log(LogLevel::Info, format!("{process} running"))]
        } else {
            vec![Self::log(
                LogLevel::Warn,
                format!("spawn confirmation for unknown {process}"),
            )]
        }
    }

    /// Spawn failure: report, drop the entry (never part of the live set),
    /// and settle its exit promise with no value.
    fn handle_spawn_failed(&mut self, process: ProcessId, reason: String) -> Vec<Action> {
        let err = ManagerError::ProcessSpawnFailure { process, reason };
        let actions = vec![Self::log(LogLevel::Error, err.to_string())];
        if let Some(exited) = self.processes.remove_spawn_failed(process) {
            self.resolve(exited, None);
        }
        actions
    }

    /// Confirmed exit: leave the live set, settle the exit promise with
    /// the exit code, note end-of-stream for any pipe partner.
    fn handle_exited(&mut self, process: ProcessId, code: Option<i32>) -> Vec<Action> {
        let Some((exited, pipe_to)) = self.processes.mark_exited(process) else {
            return vec![Self::log(
                LogLevel::Warn,
                format!("exit event for unknown {process}"),
            )];
        };
        let mut actions =
            vec![Self::log(LogLevel::Info, format!("{process} exited with code {code:?}"))];
        self.resolve(exited, code.map(|c| Bytes::from(c.to_string())));
        if let Some(target) = pipe_to {
            actions.push(Self::log(
                LogLevel::Debug,
                format!("end of stream from {process} propagated to {target}"),
            ));
        }
        actions
    }

    /// Plan a popped job into commands. The job is acknowledged only after
    /// every planned command completes; with no worker installed it is
    /// rejected immediately.
    fn handle_job(&mut self, job: Job, now: Instant) -> Vec<Action> {
        let Some(tasks) = self.queue.plan(&job) else {
            return vec![
                Self::log(LogLevel::Warn, format!("no worker installed, rejecting {}", job.id)),
                Action::NackJob { job: job.id, reason: "no worker installed".to_string() },
            ];
        };
        if tasks.is_empty() {
            return vec![Action::AckJob(job.id)];
        }
        self.queue.begin(job.id, tasks.len());
        for task in tasks {
            match task.after {
                Some(after) => {
                    self.commands.delay(task.command, after, now, Some(job.id));
                },
                None => {
                    self.commands.next(task.command, Some(job.id));
                },
            }
        }
        Vec::new()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("lifecycle", &self.lifecycle)
            .field("connections", &self.connections.len())
            .field("topics", &self.topics.topic_count())
            .field("timers", &self.timers.len())
            .field("pending_commands", &self.commands.pending())
            .field("listeners", &self.listeners.len())
            .field("live_processes", &self.processes.live_count())
            .field("promises", &self.promises.len())
            .field("jobs_in_flight", &self.queue.in_flight())
            .finish()
    }
}

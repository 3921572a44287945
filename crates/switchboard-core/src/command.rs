//! Command scheduler.
//!
//! A command is a schedulable unit of work, distinct from a durable queue
//! job: it exists only for the current process lifetime. Commands run in
//! one of four modes - `run` (synchronously, inside the current tick),
//! `next` (start of the next tick, FIFO among same-tick submissions),
//! `delay` (deadline-based, like a one-shot timer), or not at all
//! (`abort`). Listener dispatch and queue jobs enter through this same
//! scheduler, so all deferred work shares one ordering domain.
//!
//! Commands execute against [`CommandCtx`], the capability surface the
//! Manager hands to running work. The context borrows the Manager, so a
//! command can send, subscribe, schedule further commands, or settle
//! promises - all of it single-threaded, interleaved at tick boundaries.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    connection::ConnectionId,
    error::{CommandError, ManagerError},
    listener::{Listener, ListenerId},
    manager::{Action, LogLevel, Manager, ProcessHandle},
    message::Message,
    process::{ProcessId, ProcessSpec},
    promise::{Continuation, PromiseId},
    queue::JobId,
    timer::TimerId,
};

/// Opaque handle for a scheduled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command-{}", self.0)
    }
}

/// A unit of work dispatched by the Manager.
///
/// Implemented directly for stateful commands, or via the blanket impl for
/// `FnMut(&mut CommandCtx) -> Result<(), CommandError>` closures. Failures
/// are caught per-command: a failing command is reported through the log
/// channel and never aborts its siblings.
pub trait Command: Send {
    /// Execute the command against the Manager's capability surface.
    fn execute(&mut self, ctx: &mut CommandCtx<'_>) -> Result<(), CommandError>;
}

impl<F> Command for F
where
    F: FnMut(&mut CommandCtx<'_>) -> Result<(), CommandError> + Send,
{
    fn execute(&mut self, ctx: &mut CommandCtx<'_>) -> Result<(), CommandError> {
        self(ctx)
    }
}

/// Boxed command, the unit the schedulers store.
pub type BoxedCommand = Box<dyn Command>;

/// Box a closure as a command.
pub fn from_fn<F>(f: F) -> BoxedCommand
where
    F: FnMut(&mut CommandCtx<'_>) -> Result<(), CommandError> + Send + 'static,
{
    Box::new(f)
}

/// A command waiting in the scheduler, with an optional queue-job tag used
/// to acknowledge the job once all its commands finish.
pub(crate) struct Scheduled {
    pub(crate) id: CommandId,
    pub(crate) command: BoxedCommand,
    pub(crate) job: Option<JobId>,
}

/// Deadline ordering key: due instant first, then submission sequence.
///
/// The sequence makes ordering among equally-delayed commands FIFO by
/// submission, which is this implementation's documented tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DelayKey {
    due: Instant,
    seq: u64,
}

/// Scheduler for `next`- and `delay`-mode commands.
///
/// `run`-mode commands never enter the scheduler; the Manager executes
/// them inline.
#[derive(Default)]
pub struct CommandScheduler {
    next_raw: u64,
    /// Commands to run at the start of the next tick, submission order.
    queued: Vec<Scheduled>,
    /// Deadline-ordered delayed commands.
    delayed: BTreeMap<DelayKey, Scheduled>,
    /// CommandId -> deadline key, for abort.
    delay_index: HashMap<CommandId, DelayKey>,
    /// Ids of the batch currently executing (already taken out of the
    /// queues, not yet started).
    in_flight: HashSet<CommandId>,
    /// Batch entries aborted after the batch was taken. Consulted before
    /// each entry starts; a tombstoned entry never runs.
    aborted: HashSet<CommandId>,
}

impl CommandScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> CommandId {
        self.next_raw += 1;
        CommandId(self.next_raw)
    }

    /// Enqueue a command for the start of the next tick.
    pub(crate) fn next(&mut self, command: BoxedCommand, job: Option<JobId>) -> CommandId {
        let id = self.alloc();
        self.queued.push(Scheduled { id, command, job });
        id
    }

    /// Schedule a command to run once `after` has elapsed.
    pub(crate) fn delay(
        &mut self,
        command: BoxedCommand,
        after: Duration,
        now: Instant,
        job: Option<JobId>,
    ) -> CommandId {
        let id = self.alloc();
        let key = DelayKey { due: now + after, seq: self.next_raw };
        self.delayed.insert(key, Scheduled { id, command, job });
        self.delay_index.insert(id, key);
        id
    }

    /// Cancel a command scheduled via `next` or `delay`.
    ///
    /// No-op if the command already started or completed - abort never
    /// interrupts in-flight execution. A not-yet-started sibling in the
    /// batch currently executing is tombstoned and will not run.
    pub fn abort(&mut self, id: CommandId) {
        if let Some(key) = self.delay_index.remove(&id) {
            self.delayed.remove(&key);
            return;
        }
        let before = self.queued.len();
        self.queued.retain(|scheduled| scheduled.id != id);
        if self.queued.len() == before && self.in_flight.contains(&id) {
            self.aborted.insert(id);
        }
    }

    /// Take everything due at `now`: the full next-queue snapshot, then
    /// delayed commands whose deadline has passed, deadline order.
    ///
    /// Commands enqueued while the returned batch executes land in a fresh
    /// queue and run on the following tick.
    pub(crate) fn take_ready(&mut self, now: Instant) -> Vec<Scheduled> {
        let mut batch = std::mem::take(&mut self.queued);
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().due > now {
                break;
            }
            let (_, scheduled) = entry.remove_entry();
            self.delay_index.remove(&scheduled.id);
            batch.push(scheduled);
        }
        self.in_flight = batch.iter().map(|scheduled| scheduled.id).collect();
        batch
    }

    /// Take only the next-queue. Used by `stop` to drain in-flight work
    /// without promoting not-yet-due delayed commands.
    pub(crate) fn take_queued(&mut self) -> Vec<Scheduled> {
        let batch = std::mem::take(&mut self.queued);
        self.in_flight = batch.iter().map(|scheduled| scheduled.id).collect();
        batch
    }

    /// Retire a batch entry just before it runs. Returns `false` if the
    /// entry was aborted after the batch was taken, in which case it must
    /// not execute.
    pub(crate) fn start(&mut self, id: CommandId) -> bool {
        self.in_flight.remove(&id);
        !self.aborted.remove(&id)
    }

    /// Discard batch bookkeeping once every entry was started or dropped.
    pub(crate) fn finish_batch(&mut self) {
        self.in_flight.clear();
        self.aborted.clear();
    }

    /// Number of commands waiting in either queue.
    pub fn pending(&self) -> usize {
        self.queued.len() + self.delayed.len()
    }

    /// Drop everything still scheduled.
    pub fn clear(&mut self) {
        self.queued.clear();
        self.delayed.clear();
        self.delay_index.clear();
        self.in_flight.clear();
        self.aborted.clear();
    }
}

impl fmt::Debug for CommandScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("queued", &self.queued.len())
            .field("delayed", &self.delayed.len())
            .finish()
    }
}

/// Capability surface handed to executing commands.
///
/// Borrows the Manager, so everything a command does mutates the same
/// single-threaded state the control loop owns. External side effects
/// (sends, closes, spawns) are appended to the current tick's action batch
/// for the runtime to execute.
pub struct CommandCtx<'a> {
    manager: &'a mut Manager,
    actions: &'a mut Vec<Action>,
    now: Instant,
}

impl<'a> CommandCtx<'a> {
    pub(crate) fn new(
        manager: &'a mut Manager,
        now: Instant,
        actions: &'a mut Vec<Action>,
    ) -> Self {
        Self { manager, actions, now }
    }

    /// The tick's notion of the current time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Send a message to one connection. A closed target is reported, not
    /// raised.
    pub fn send(&mut self, message: &Message, connection: ConnectionId) {
        let actions = self.manager.send(message, connection);
        self.actions.extend(actions);
    }

    /// Send a message, then unconditionally close the connection.
    pub fn end(&mut self, message: &Message, connection: ConnectionId) {
        let actions = self.manager.end(message, connection);
        self.actions.extend(actions);
    }

    /// Broadcast to the given set, or to every open connection if `None`.
    pub fn broadcast(&mut self, message: &Message, targets: Option<&[ConnectionId]>) {
        let actions = self.manager.broadcast(message, targets);
        self.actions.extend(actions);
    }

    /// Broadcast to a topic's current subscriber set.
    pub fn publish(&mut self, topic: &str, message: &Message) -> Result<(), ManagerError> {
        let actions = self.manager.publish(topic, message)?;
        self.actions.extend(actions);
        Ok(())
    }

    /// Close a connection and cascade its unsubscriptions.
    pub fn close(&mut self, connection: ConnectionId, reason: &str) {
        let actions = self.manager.close(connection, reason);
        self.actions.extend(actions);
    }

    /// Register a topic. No-op if already present.
    pub fn register(&mut self, topic: &str) {
        let actions = self.manager.register(topic);
        self.actions.extend(actions);
    }

    /// Unregister a topic, unsubscribing (not closing) its members.
    pub fn unregister(&mut self, topic: &str) {
        let actions = self.manager.unregister(topic);
        self.actions.extend(actions);
    }

    /// Subscribe a connection to a registered topic.
    pub fn subscribe(
        &mut self,
        topic: &str,
        connection: ConnectionId,
    ) -> Result<(), ManagerError> {
        self.manager.subscribe(topic, connection)
    }

    /// Unsubscribe. No-op if the pair does not exist.
    pub fn unsubscribe(&mut self, topic: &str, connection: ConnectionId) {
        self.manager.unsubscribe(topic, connection);
    }

    /// Run a command synchronously, before control returns to this one.
    pub fn run(&mut self, command: BoxedCommand) -> Result<(), CommandError> {
        let now = self.now;
        self.manager.run_inner(command, now, self.actions)
    }

    /// Schedule a command for the start of the next tick.
    pub fn next(&mut self, command: BoxedCommand) -> CommandId {
        self.manager.next(command)
    }

    /// Schedule a command to run after a delay.
    pub fn delay(&mut self, command: BoxedCommand, after: Duration) -> CommandId {
        let now = self.now;
        self.manager.delay(command, after, now)
    }

    /// Abort a scheduled command. No-op once it has started or completed.
    pub fn abort(&mut self, command: CommandId) {
        self.manager.abort(command);
    }

    /// Add a recurring timer, first firing after `every`.
    pub fn add_timer(&mut self, every: Duration, command: BoxedCommand) -> TimerId {
        let now = self.now;
        self.manager.add_timer(every, command, now)
    }

    /// Add a one-shot timer that auto-removes after firing.
    pub fn once(&mut self, after: Duration, command: BoxedCommand) -> TimerId {
        let now = self.now;
        self.manager.once(after, command, now)
    }

    /// Pause a timer, preserving its remaining interval.
    pub fn pause_timer(&mut self, timer: TimerId) -> bool {
        let now = self.now;
        self.manager.pause_timer(timer, now)
    }

    /// Resume a paused timer without resetting its phase.
    pub fn resume_timer(&mut self, timer: TimerId) -> bool {
        let now = self.now;
        self.manager.resume_timer(timer, now)
    }

    /// Cancel a timer in any state. Idempotent.
    pub fn cancel_timer(&mut self, timer: TimerId) {
        self.manager.cancel_timer(timer);
    }

    /// Install an exact-key listener.
    pub fn listen<F>(&mut self, key: impl Into<String>, factory: F) -> ListenerId
    where
        F: FnMut(&Message) -> BoxedCommand + Send + 'static,
    {
        self.manager.listen(key, factory)
    }

    /// Install a listener unit directly (wildcard/multi-key matching).
    pub fn add_listener(&mut self, listener: Box<dyn Listener>) -> ListenerId {
        self.manager.add_listener(listener)
    }

    /// Remove a listener.
    pub fn silence(&mut self, listener: ListenerId) {
        self.manager.silence(listener);
    }

    /// Spawn an external process; its exit settles the returned handle's
    /// promise.
    pub fn execute(&mut self, spec: ProcessSpec) -> ProcessHandle {
        let (handle, actions) = self.manager.execute(spec);
        self.actions.extend(actions);
        handle
    }

    /// Signal a live process to terminate. No-op if already exited.
    pub fn terminate(&mut self, process: ProcessId) {
        let actions = self.manager.terminate(process);
        self.actions.extend(actions);
    }

    /// Pipe `input`'s output stream into `output`'s input stream,
    /// restarting either process if it already exited.
    pub fn pipe(&mut self, input: ProcessId, output: ProcessId) -> Result<(), ManagerError> {
        let actions = self.manager.pipe(input, output)?;
        self.actions.extend(actions);
        Ok(())
    }

    /// Create an unsettled promise.
    pub fn new_promise(&mut self) -> PromiseId {
        self.manager.new_promise()
    }

    /// Settle a promise. At most once; later settlements are no-ops.
    pub fn resolve(&mut self, promise: PromiseId, value: Option<Bytes>) {
        self.manager.resolve(promise, value);
    }

    /// Register a continuation to run (via the scheduler) once the promise
    /// settles.
    pub fn on_settled(&mut self, promise: PromiseId, continuation: Box<dyn Continuation>) {
        self.manager.on_settled(promise, continuation);
    }

    /// Emit a log entry through the action channel.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.actions.push(Action::Log { level, message: message.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> BoxedCommand {
        from_fn(|_ctx| Ok(()))
    }

    #[test]
    fn next_preserves_submission_order() {
        let mut scheduler = CommandScheduler::new();
        let now = Instant::now();

        let first = scheduler.next(noop(), None);
        let second = scheduler.next(noop(), None);

        let batch = scheduler.take_ready(now);
        let ids: Vec<_> = batch.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn delayed_commands_wait_for_deadline() {
        let mut scheduler = CommandScheduler::new();
        let now = Instant::now();

        let id = scheduler.delay(noop(), Duration::from_millis(50), now, None);

        assert!(scheduler.take_ready(now).is_empty());

        let later = now + Duration::from_millis(60);
        let batch = scheduler.take_ready(later);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn equal_deadlines_run_fifo_by_submission() {
        let mut scheduler = CommandScheduler::new();
        let now = Instant::now();
        let delay = Duration::from_millis(10);

        let first = scheduler.delay(noop(), delay, now, None);
        let second = scheduler.delay(noop(), delay, now, None);

        let batch = scheduler.take_ready(now + delay);
        let ids: Vec<_> = batch.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn abort_removes_queued_and_delayed() {
        let mut scheduler = CommandScheduler::new();
        let now = Instant::now();

        let queued = scheduler.next(noop(), None);
        let delayed = scheduler.delay(noop(), Duration::from_millis(5), now, None);

        scheduler.abort(queued);
        scheduler.abort(delayed);
        assert_eq!(scheduler.pending(), 0);

        // Aborting an unknown id is a no-op, never an error.
        scheduler.abort(CommandId(999));
    }

    #[test]
    fn abort_tombstones_a_sibling_in_the_taken_batch() {
        let mut scheduler = CommandScheduler::new();
        let now = Instant::now();

        let first = scheduler.next(noop(), None);
        let second = scheduler.next(noop(), None);
        let batch = scheduler.take_ready(now);
        assert_eq!(batch.len(), 2);

        // As if `first`'s execution aborted `second` before it started.
        assert!(scheduler.start(first));
        scheduler.abort(second);
        assert!(!scheduler.start(second));
        scheduler.finish_batch();

        // Aborting a command that already started is a no-op: a fresh
        // submission reusing the scheduler is unaffected.
        scheduler.abort(first);
        let third = scheduler.next(noop(), None);
        let batch = scheduler.take_ready(now);
        assert_eq!(batch.len(), 1);
        assert!(scheduler.start(third));
        scheduler.finish_batch();
    }

    #[test]
    fn take_ready_mixes_queue_before_due_delayed() {
        let mut scheduler = CommandScheduler::new();
        let now = Instant::now();

        let delayed = scheduler.delay(noop(), Duration::ZERO, now, None);
        let queued = scheduler.next(noop(), None);

        let batch = scheduler.take_ready(now);
        let ids: Vec<_> = batch.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![queued, delayed]);
    }
}

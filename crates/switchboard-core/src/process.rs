//! Process supervisor bookkeeping.
//!
//! The table tracks intent and confirmed state for external OS processes;
//! the actual spawn/signal/stream calls are actions executed by the
//! runtime. A process is Spawning from `execute` until the runtime
//! confirms it, Running until it is signalled or exits, and Exited
//! terminally - exit is confirmed by an event, never by polling. Each
//! process carries an exit promise settled when the exit event arrives,
//! and optionally a pipe partner receiving its output stream.

use std::{collections::HashMap, fmt};

use crate::promise::PromiseId;

/// Opaque handle for a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process-{}", self.0)
    }
}

/// What to spawn: program plus arguments. No shell interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// Spec for a program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawn requested, not yet confirmed by the runtime.
    Spawning,
    /// Confirmed running.
    Running,
    /// Termination signalled, exit not yet confirmed.
    Terminating,
    /// Exit confirmed. Terminal.
    Exited,
}

#[derive(Debug)]
struct ProcessEntry {
    spec: ProcessSpec,
    state: ProcessState,
    /// Settled when the process exits (or the spawn fails).
    exited: PromiseId,
    /// Pipe partner receiving this process's output stream.
    pipe_to: Option<ProcessId>,
}

/// Supervisor-side table of known processes.
#[derive(Debug, Default)]
pub struct ProcessTable {
    next_raw: u64,
    entries: HashMap<ProcessId, ProcessEntry>,
}

impl ProcessTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a spawn intent. The process enters the live set only once
    /// the runtime confirms the spawn.
    pub(crate) fn insert(&mut self, spec: ProcessSpec, exited: PromiseId) -> ProcessId {
        self.next_raw += 1;
        let id = ProcessId(self.next_raw);
        self.entries
            .insert(id, ProcessEntry { spec, state: ProcessState::Spawning, exited, pipe_to: None });
        id
    }

    /// Runtime confirmed the spawn. Returns `false` for unknown ids or
    /// states other than Spawning.
    pub(crate) fn mark_running(&mut self, id: ProcessId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.state == ProcessState::Spawning => {
                entry.state = ProcessState::Running;
                true
            },
            _ => false,
        }
    }

    /// Spawn failed: drop the entry entirely (never part of the live set)
    /// and hand back its exit promise so the failure settles it.
    pub(crate) fn remove_spawn_failed(&mut self, id: ProcessId) -> Option<PromiseId> {
        let entry = self.entries.remove(&id)?;
        Some(entry.exited)
    }

    /// Termination signalled. Only valid while live; returns `false`
    /// otherwise, making repeated or late terminates no-ops.
    pub(crate) fn begin_terminate(&mut self, id: ProcessId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry)
                if matches!(entry.state, ProcessState::Spawning | ProcessState::Running) =>
            {
                entry.state = ProcessState::Terminating;
                true
            },
            _ => false,
        }
    }

    /// Exit confirmed. Returns the exit promise and the pipe partner (if
    /// any) so the Manager can settle the one and log end-of-stream
    /// propagation for the other. `None` for unknown or already-exited.
    pub(crate) fn mark_exited(&mut self, id: ProcessId) -> Option<(PromiseId, Option<ProcessId>)> {
        let entry = self.entries.get_mut(&id)?;
        if entry.state == ProcessState::Exited {
            return None;
        }
        entry.state = ProcessState::Exited;
        Some((entry.exited, entry.pipe_to))
    }

    /// Re-arm an exited process for respawn (used when piping a process
    /// that already finished). Returns the spec to spawn.
    pub(crate) fn respawn(&mut self, id: ProcessId, exited: PromiseId) -> Option<ProcessSpec> {
        let entry = self.entries.get_mut(&id)?;
        if entry.state != ProcessState::Exited {
            return None;
        }
        entry.state = ProcessState::Spawning;
        entry.exited = exited;
        entry.pipe_to = None;
        Some(entry.spec.clone())
    }

    /// Record a pipe link: `from`'s output stream feeds `to`'s input.
    pub(crate) fn link(&mut self, from: ProcessId, to: ProcessId) -> bool {
        match self.entries.get_mut(&from) {
            Some(entry) => {
                entry.pipe_to = Some(to);
                true
            },
            None => false,
        }
    }

    /// Current state, `None` for unknown ids.
    pub fn state(&self, id: ProcessId) -> Option<ProcessState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    /// Whether the process is in the live set (spawned, exit unconfirmed).
    pub fn is_live(&self, id: ProcessId) -> bool {
        !matches!(self.state(id), None | Some(ProcessState::Exited))
    }

    /// Exit promise of a known process.
    pub fn exit_promise(&self, id: ProcessId) -> Option<PromiseId> {
        self.entries.get(&id).map(|entry| entry.exited)
    }

    /// Pipe partner of a known process.
    pub fn pipe_target(&self, id: ProcessId) -> Option<ProcessId> {
        self.entries.get(&id).and_then(|entry| entry.pipe_to)
    }

    /// Ids of every live process.
    pub fn live_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> =
            self.entries.keys().copied().filter(|id| self.is_live(*id)).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live processes.
    pub fn live_count(&self) -> usize {
        self.live_ids().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::promise::PromiseResolver;

    fn promise(resolver: &mut PromiseResolver) -> PromiseId {
        resolver.create()
    }

    #[test]
    fn spawn_confirm_exit_flow() {
        let mut resolver = PromiseResolver::new();
        let mut table = ProcessTable::new();

        let id = table.insert(ProcessSpec::new("sleep").arg("1"), promise(&mut resolver));
        assert_eq!(table.state(id), Some(ProcessState::Spawning));
        assert!(table.is_live(id));

        assert!(table.mark_running(id));
        assert_eq!(table.state(id), Some(ProcessState::Running));

        let (exited, pipe_to) = table.mark_exited(id).unwrap();
        assert_eq!(Some(exited), table.exit_promise(id));
        assert!(pipe_to.is_none());
        assert!(!table.is_live(id));

        // Exit is terminal; a second confirmation is a no-op.
        assert!(table.mark_exited(id).is_none());
    }

    #[test]
    fn terminate_after_exit_is_noop() {
        let mut resolver = PromiseResolver::new();
        let mut table = ProcessTable::new();

        let id = table.insert(ProcessSpec::new("true"), promise(&mut resolver));
        table.mark_running(id);
        table.mark_exited(id);

        assert!(!table.begin_terminate(id));
    }

    #[test]
    fn spawn_failure_removes_entry() {
        let mut resolver = PromiseResolver::new();
        let mut table = ProcessTable::new();

        let id = table.insert(ProcessSpec::new("nope"), promise(&mut resolver));
        assert!(table.remove_spawn_failed(id).is_some());
        assert_eq!(table.state(id), None);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn respawn_rearms_exited_process() {
        let mut resolver = PromiseResolver::new();
        let mut table = ProcessTable::new();

        let id = table.insert(ProcessSpec::new("cat"), promise(&mut resolver));
        table.mark_running(id);
        table.mark_exited(id);

        // Live processes cannot be respawned.
        let other = table.insert(ProcessSpec::new("cat"), promise(&mut resolver));
        assert!(table.respawn(other, promise(&mut resolver)).is_none());

        let spec = table.respawn(id, promise(&mut resolver)).unwrap();
        assert_eq!(spec.program, "cat");
        assert_eq!(table.state(id), Some(ProcessState::Spawning));
    }

    #[test]
    fn pipe_link_is_recorded() {
        let mut resolver = PromiseResolver::new();
        let mut table = ProcessTable::new();

        let from = table.insert(ProcessSpec::new("producer"), promise(&mut resolver));
        let to = table.insert(ProcessSpec::new("consumer"), promise(&mut resolver));

        assert!(table.link(from, to));
        assert_eq!(table.pipe_target(from), Some(to));
        assert_eq!(table.pipe_target(to), None);
    }
}

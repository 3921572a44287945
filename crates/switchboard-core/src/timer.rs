//! Timer wheel.
//!
//! Recurring and one-shot timers driving the control loop's notion of
//! time. States: scheduled -> paused -> scheduled (pause/resume preserves
//! the remaining interval; resume does not reset the phase), cancelled
//! (terminal, idempotent), and for one-shot timers fired (terminal,
//! auto-removed). Time is passed into the methods that need it; the wheel
//! never reads a clock.
//!
//! Callbacks run on the control-loop tick: a long-running callback delays
//! all other scheduled work (cooperative, non-preemptive).

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::{Duration, Instant},
};

use crate::command::BoxedCommand;

/// Opaque handle for a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Recurring interval or one-shot delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Recurring(Duration),
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Scheduled { due: Instant },
    Paused { remaining: Duration },
}

/// A timer plus the command it fires.
pub(crate) struct TimerEntry {
    pub(crate) command: BoxedCommand,
    kind: TimerKind,
    state: TimerState,
}

/// Deadline table for recurring and one-shot timers.
#[derive(Default)]
pub struct TimerWheel {
    next_raw: u64,
    entries: HashMap<TimerId, TimerEntry>,
    /// Timers drawn due by [`Self::take_due`] whose firing has not
    /// finished yet (their entries are temporarily removed).
    in_flight: HashSet<TimerId>,
    /// Due timers cancelled before or during their callback. A cancelled
    /// due timer must neither fire nor reschedule.
    cancelled: HashSet<TimerId>,
}

impl TimerWheel {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> TimerId {
        self.next_raw += 1;
        TimerId(self.next_raw)
    }

    /// Schedule a recurring timer, first firing after `every`.
    pub(crate) fn add(
        &mut self,
        every: Duration,
        command: BoxedCommand,
        now: Instant,
    ) -> TimerId {
        let id = self.alloc();
        self.entries.insert(id, TimerEntry {
            command,
            kind: TimerKind::Recurring(every),
            state: TimerState::Scheduled { due: now + every },
        });
        id
    }

    /// Schedule a one-shot timer firing after `after`, then auto-removed.
    /// Re-arming requires a fresh `once`.
    pub(crate) fn once(
        &mut self,
        after: Duration,
        command: BoxedCommand,
        now: Instant,
    ) -> TimerId {
        let id = self.alloc();
        self.entries.insert(id, TimerEntry {
            command,
            kind: TimerKind::Once,
            state: TimerState::Scheduled { due: now + after },
        });
        id
    }

    /// Pause a scheduled timer, capturing its remaining interval.
    /// Returns `false` for unknown or already-paused timers.
    pub fn pause(&mut self, id: TimerId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => match entry.state {
                TimerState::Scheduled { due } => {
                    entry.state =
                        TimerState::Paused { remaining: due.saturating_duration_since(now) };
                    true
                },
                TimerState::Paused { .. } => false,
            },
            None => false,
        }
    }

    /// Resume a paused timer; the captured remaining interval continues
    /// from `now`. Returns `false` for unknown or non-paused timers.
    pub fn resume(&mut self, id: TimerId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => match entry.state {
                TimerState::Paused { remaining } => {
                    entry.state = TimerState::Scheduled { due: now + remaining };
                    true
                },
                TimerState::Scheduled { .. } => false,
            },
            None => false,
        }
    }

    /// Remove a timer regardless of state. Idempotent.
    ///
    /// Cancelling a timer already drawn due (a sibling in the same sweep,
    /// or the firing timer itself from inside its own callback) prevents
    /// it from firing or being rescheduled, but never preempts a running
    /// callback.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id);
        if self.in_flight.contains(&id) {
            self.cancelled.insert(id);
        }
    }

    /// Remove and return every timer due at `now`, ordered by deadline
    /// (timer id breaks ties, so firing order is deterministic).
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(TimerId, TimerEntry)> {
        let mut due: Vec<(Instant, TimerId)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry.state {
                TimerState::Scheduled { due } if due <= now => Some((due, *id)),
                _ => None,
            })
            .collect();
        due.sort_unstable();

        let batch: Vec<(TimerId, TimerEntry)> = due
            .into_iter()
            .filter_map(|(_, id)| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect();
        self.in_flight = batch.iter().map(|(id, _)| *id).collect();
        batch
    }

    /// Whether a timer drawn due by [`Self::take_due`] may still fire.
    /// Returns `false` once it was cancelled mid-sweep.
    pub(crate) fn begin_fire(&self, id: TimerId) -> bool {
        !self.cancelled.contains(&id)
    }

    /// Finish a firing (or a cancelled skip): reschedule recurring timers
    /// unless cancelled mid-sweep, drop one-shot timers. Returns `true`
    /// if the timer was rescheduled.
    pub(crate) fn finish_fire(&mut self, id: TimerId, entry: TimerEntry, now: Instant) -> bool {
        self.in_flight.remove(&id);
        if self.cancelled.remove(&id) {
            return false;
        }
        match entry.kind {
            TimerKind::Recurring(every) => {
                let mut entry = entry;
                entry.state = TimerState::Scheduled { due: now + every };
                self.entries.insert(id, entry);
                true
            },
            TimerKind::Once => false,
        }
    }

    /// Whether the timer is known to the wheel.
    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all timers.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
        self.cancelled.clear();
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel").field("timers", &self.entries.len()).finish()
    }
}

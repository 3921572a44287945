//! Integration tests driving the Manager through its public event API.
//!
//! Each test plays a small scenario end to end: events in, actions out,
//! with time passed explicitly so every schedule is deterministic.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use switchboard_core::{
    from_fn, Action, CommandError, ConnectionId, Event, Manager, Message, ProcessSpec,
};

fn started() -> Manager {
    let mut manager = Manager::default();
    manager.boot().unwrap();
    manager.start().unwrap();
    manager
}

fn open(manager: &mut Manager, raw: u64, now: Instant) -> ConnectionId {
    let conn = ConnectionId::new(raw);
    manager.handle(Event::Opened(conn), now).unwrap();
    conn
}

fn send_targets(actions: &[Action]) -> Vec<ConnectionId> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Send { connection, .. } => Some(*connection),
            _ => None,
        })
        .collect()
}

#[test]
fn closing_a_subscriber_excludes_it_from_the_next_publish() {
    let mut manager = started();
    let now = Instant::now();
    let alice = open(&mut manager, 1, now);
    let bob = open(&mut manager, 2, now);

    manager.register("lobby");
    manager.subscribe("lobby", alice).unwrap();
    manager.subscribe("lobby", bob).unwrap();

    manager.close(bob, "left");

    let actions = manager.publish("lobby", &Message::new("lobby", "hello")).unwrap();
    assert_eq!(send_targets(&actions), vec![alice]);
}

#[test]
fn broadcast_survives_closed_targets_in_an_explicit_set() {
    let mut manager = started();
    let now = Instant::now();
    let alive = open(&mut manager, 1, now);
    let dead = ConnectionId::new(99);

    let actions = manager.broadcast(&Message::new("news", "flash"), Some(&[dead, alive]));

    assert_eq!(send_targets(&actions), vec![alive]);
    // The skipped target is reported after the sweep, not mid-way.
    assert!(actions.iter().any(
        |action| matches!(action, Action::Log { message, .. } if message.contains("connection-99"))
    ));
}

#[test]
fn unregister_unsubscribes_without_closing() {
    let mut manager = started();
    let now = Instant::now();
    let alice = open(&mut manager, 1, now);

    manager.register("ephemeral");
    manager.subscribe("ephemeral", alice).unwrap();

    manager.unregister("ephemeral");

    assert!(manager.is_open(alice));
    assert!(!manager.is_registered("ephemeral"));
    assert!(manager.publish("ephemeral", &Message::new("ephemeral", "x")).is_err());
}

#[test]
fn aborted_delayed_command_never_runs() {
    let mut manager = started();
    let now = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in = fired.clone();
    let id = manager.delay(
        from_fn(move |_ctx| {
            fired_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        Duration::from_millis(50),
        now,
    );
    manager.abort(id);

    manager.handle(Event::Tick, now + Duration::from_millis(60)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn abort_after_completion_is_a_noop() {
    let mut manager = started();
    let now = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in = fired.clone();
    let id = manager.next(from_fn(move |_ctx| {
        fired_in.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    manager.handle(Event::Tick, now).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Already completed; nothing to cancel, nothing to undo.
    manager.abort(id);
    manager.handle(Event::Tick, now).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn first_promise_resolution_wins_the_race() {
    let mut manager = started();
    let now = Instant::now();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let promise = manager.new_promise();
    let seen_in = seen.clone();
    manager.on_settled(
        promise,
        Box::new(move |value: Option<Bytes>| {
            let seen = seen_in.clone();
            from_fn(move |_ctx| {
                seen.lock().unwrap().push(value.clone());
                Ok(())
            })
        }),
    );

    manager.resolve(promise, Some(Bytes::from("r1")));
    manager.resolve(promise, Some(Bytes::from("r2")));
    manager.handle(Event::Tick, now).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(Bytes::from("r1"))]);
    assert_eq!(manager.settled_value(promise), Some(Some(Bytes::from("r1"))));
}

#[test]
fn chat_room_scenario() {
    let mut manager = started();
    let now = Instant::now();

    manager.register("lobby");
    manager.listen("join", |message| {
        let origin = message.origin;
        from_fn(move |ctx| {
            if let Some(conn) = origin {
                ctx.subscribe("lobby", conn)?;
            }
            Ok(())
        })
    });
    manager.listen("say", |message| {
        let relay = Message::new("lobby", message.payload.clone());
        from_fn(move |ctx| {
            ctx.publish("lobby", &relay)?;
            Ok(())
        })
    });

    let alice = open(&mut manager, 1, now);
    let bob = open(&mut manager, 2, now);

    for conn in [alice, bob] {
        let message = Message::inbound("join", "", conn);
        manager.handle(Event::Received { connection: conn, message }, now).unwrap();
    }
    manager.handle(Event::Tick, now).unwrap();
    assert!(manager.is_subscribed("lobby", alice));
    assert!(manager.is_subscribed("lobby", bob));

    let message = Message::inbound("say", "hello everyone", alice);
    manager.handle(Event::Received { connection: alice, message }, now).unwrap();
    let actions = manager.handle(Event::Tick, now).unwrap();

    let mut targets = send_targets(&actions);
    targets.sort_unstable();
    assert_eq!(targets, vec![alice, bob]);
}

#[test]
fn next_commands_run_fifo_within_one_tick() {
    let mut manager = started();
    let now = Instant::now();
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["a", "b", "c"] {
        let order = order.clone();
        manager.next(from_fn(move |_ctx| {
            order.lock().unwrap().push(tag);
            Ok(())
        }));
    }

    manager.handle(Event::Tick, now).unwrap();
    assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
}

#[test]
fn equal_deadline_delays_run_in_submission_order() {
    let mut manager = started();
    let now = Instant::now();
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second"] {
        let order = order.clone();
        manager.delay(
            from_fn(move |_ctx| {
                order.lock().unwrap().push(tag);
                Ok(())
            }),
            Duration::from_millis(10),
            now,
        );
    }

    manager.handle(Event::Tick, now + Duration::from_millis(10)).unwrap();
    assert_eq!(*order.lock().unwrap(), ["first", "second"]);
}

#[test]
fn paused_timer_keeps_its_phase_across_resume() {
    let mut manager = started();
    let t0 = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in = fired.clone();
    let id = manager.add_timer(
        Duration::from_millis(100),
        from_fn(move |_ctx| {
            fired_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        t0,
    );

    // Pause 60ms in: 40ms of the interval remain.
    assert!(manager.pause_timer(id, t0 + Duration::from_millis(60)));
    manager.handle(Event::Tick, t0 + Duration::from_secs(5)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let resume_at = t0 + Duration::from_secs(10);
    assert!(manager.resume_timer(id, resume_at));
    manager.handle(Event::Tick, resume_at + Duration::from_millis(39)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    manager.handle(Event::Tick, resume_at + Duration::from_millis(40)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn recurring_timer_fires_every_interval() {
    let mut manager = started();
    let t0 = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in = fired.clone();
    manager.add_timer(
        Duration::from_millis(100),
        from_fn(move |_ctx| {
            fired_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        t0,
    );

    for tick in 1..=3 {
        manager.handle(Event::Tick, t0 + Duration::from_millis(100 * tick)).unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn timer_callback_failure_is_isolated() {
    let mut manager = started();
    let t0 = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));

    manager.add_timer(
        Duration::from_millis(10),
        from_fn(|_ctx| Err(CommandError::failed("flaky"))),
        t0,
    );
    let fired_in = fired.clone();
    manager.add_timer(
        Duration::from_millis(10),
        from_fn(move |_ctx| {
            fired_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        t0,
    );

    let actions = manager.handle(Event::Tick, t0 + Duration::from_millis(10)).unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(actions
        .iter()
        .any(|action| matches!(action, Action::Log { message, .. } if message.contains("flaky"))));
    // The failing timer stays scheduled for its next interval.
    let actions = manager.handle(Event::Tick, t0 + Duration::from_millis(20)).unwrap();
    assert!(actions
        .iter()
        .any(|action| matches!(action, Action::Log { message, .. } if message.contains("flaky"))));
}

#[test]
fn pipe_links_processes_and_notes_end_of_stream() {
    let mut manager = started();
    let now = Instant::now();

    let (producer, _) = manager.execute(ProcessSpec::new("yes"));
    let (consumer, _) = manager.execute(ProcessSpec::new("cat"));
    manager.handle(Event::ProcessSpawned(producer.id), now).unwrap();
    manager.handle(Event::ProcessSpawned(consumer.id), now).unwrap();

    let actions = manager.pipe(producer.id, consumer.id).unwrap();
    assert!(actions.contains(&Action::Pipe { from: producer.id, to: consumer.id }));

    // Producer exit: end of stream reaches the consumer, which keeps running.
    let actions = manager
        .handle(Event::ProcessExited { process: producer.id, code: Some(0) }, now)
        .unwrap();
    assert!(actions.iter().any(
        |action| matches!(action, Action::Log { message, .. } if message.contains("end of stream"))
    ));
    assert_eq!(manager.live_processes(), 1);
}

#[test]
fn pipe_respawns_an_exited_member() {
    let mut manager = started();
    let now = Instant::now();

    let (producer, _) = manager.execute(ProcessSpec::new("yes"));
    let (consumer, _) = manager.execute(ProcessSpec::new("cat"));
    manager.handle(Event::ProcessSpawned(producer.id), now).unwrap();
    manager.handle(Event::ProcessSpawned(consumer.id), now).unwrap();
    manager
        .handle(Event::ProcessExited { process: consumer.id, code: Some(0) }, now)
        .unwrap();

    let actions = manager.pipe(producer.id, consumer.id).unwrap();

    assert!(actions
        .iter()
        .any(|action| matches!(action, Action::Spawn { process, .. } if *process == consumer.id)));
    assert!(actions.contains(&Action::Pipe { from: producer.id, to: consumer.id }));
}

#[test]
fn subscribe_requires_an_open_connection() {
    let mut manager = started();

    manager.register("lobby");
    let ghost = ConnectionId::new(404);

    let result = manager.subscribe("lobby", ghost);
    assert!(result.is_err());
    assert!(!manager.is_subscribed("lobby", ghost));
}

#[test]
fn late_continuation_on_settled_promise_runs_next_tick() {
    let mut manager = started();
    let now = Instant::now();
    let seen = Arc::new(Mutex::new(None));

    let promise = manager.new_promise();
    manager.resolve(promise, Some(Bytes::from("early")));

    let seen_in = seen.clone();
    manager.on_settled(
        promise,
        Box::new(move |value: Option<Bytes>| {
            let seen = seen_in.clone();
            from_fn(move |_ctx| {
                *seen.lock().unwrap() = value.clone();
                Ok(())
            })
        }),
    );

    manager.handle(Event::Tick, now).unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(Bytes::from("early")));
}

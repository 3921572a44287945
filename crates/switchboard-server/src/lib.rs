//! Switchboard production server.
//!
//! Runtime glue around [`switchboard_core`]: TCP transport with
//! length-prefixed frames, a tokio control loop that owns the
//! [`Manager`], child-process hosting, and a queue connector pump.
//!
//! # Architecture
//!
//! The core is sans-IO, so this crate does all the I/O. One task owns the
//! Manager and is the only place core state is touched. Everything else -
//! the accept loop, one reader task per connection, process wait tasks,
//! the queue pump - posts [`LoopEvent`]s into that task over an mpsc
//! channel, and the task executes the [`Action`]s the Manager returns.
//! A `tokio::time::interval` drives [`Event::Tick`].
//!
//! # Components
//!
//! - [`Server`]: binds the listener and runs the control loop
//! - [`wire`]: the frame codec (the core never sees wire bytes)
//! - [`ProcessHost`]: spawns, signals, and pipes child processes
//! - [`QueueConnector`]: edge to an external job queue

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod queue;
mod supervisor;
pub mod wire;

use std::{collections::HashMap, net::SocketAddr, time::Duration};

pub use error::{ServerError, WireError};
pub use queue::{in_memory, InMemoryQueue, QueueCommand, QueueConnector, QueueHandle};
pub use supervisor::ProcessHost;
use switchboard_core::{
    Action, ConnectionId, Event, LogLevel, Manager, ManagerConfig, Message,
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::mpsc,
    time::{Instant as TokioInstant, MissedTickBehavior},
};

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:7600")
    pub bind_address: String,
    /// Interval between control-loop ticks
    pub tick_interval: Duration,
    /// Core configuration (connection cap, drain limit)
    pub manager: ManagerConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7600".to_string(),
            tick_interval: Duration::from_millis(25),
            manager: ManagerConfig::default(),
        }
    }
}

/// Everything that enters the control loop.
pub enum LoopEvent {
    /// An event for the Manager.
    Core(Event),
    /// The accept loop admitted a connection; the loop takes ownership of
    /// the write half (reads happen in a per-connection task).
    Accepted {
        /// Runtime-assigned connection id
        connection: ConnectionId,
        /// Write half of the accepted stream
        writer: OwnedWriteHalf,
    },
}

/// The production server: a bound listener plus its runtime config.
pub struct Server {
    listener: TcpListener,
    config: ServerRuntimeConfig,
}

impl Server {
    /// Bind the listen socket.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_address).await.map_err(|source| {
            ServerError::Bind { address: config.bind_address.clone(), source }
        })?;
        Ok(Self { listener, config })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the control loop until shutdown (ctrl-c).
    ///
    /// `manager` must be booted, with listeners, topics, and the queue
    /// worker already installed; `run` starts it and serves. The optional
    /// connector feeds queue jobs into the loop.
    pub async fn run(
        self,
        manager: Manager,
        connector: Option<Box<dyn QueueConnector>>,
    ) -> Result<(), ServerError> {
        let (events_tx, mut events_rx) = mpsc::channel::<LoopEvent>(1024);

        let accept_tx = events_tx.clone();
        let listener = self.listener;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let connection = random_connection_id();
                        tracing::info!(%connection, %peer, "accepted");
                        let (reader, writer) = stream.into_split();
                        if accept_tx.send(LoopEvent::Accepted { connection, writer }).await.is_err()
                        {
                            break;
                        }
                        spawn_reader(connection, reader, accept_tx.clone());
                    },
                    Err(err) => tracing::warn!(%err, "accept failed"),
                }
            }
        });

        let queue_commands = connector.map(|connector| queue::spawn_pump(connector, events_tx.clone()));
        let mut control = ControlLoop {
            manager,
            writers: HashMap::new(),
            host: ProcessHost::new(events_tx.clone()),
            queue_commands,
        };

        let actions = control.manager.start()?;
        control.apply(actions).await?;

        let mut ticker = tokio::time::interval_at(
            TokioInstant::now() + self.config.tick_interval,
            self.config.tick_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    control.dispatch(Event::Tick).await?;
                },
                event = events_rx.recv() => match event {
                    Some(LoopEvent::Core(event)) => control.dispatch(event).await?,
                    Some(LoopEvent::Accepted { connection, writer }) => {
                        control.writers.insert(connection, writer);
                        control.dispatch(Event::Opened(connection)).await?;
                    },
                    None => break,
                },
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    let actions = control.manager.stop(std::time::Instant::now())?;
                    control.apply(actions).await?;
                    break;
                },
            }
        }
        Ok(())
    }
}

/// The single task that owns the Manager and executes its actions.
struct ControlLoop {
    manager: Manager,
    writers: HashMap<ConnectionId, OwnedWriteHalf>,
    host: ProcessHost,
    queue_commands: Option<mpsc::Sender<QueueCommand>>,
}

impl ControlLoop {
    /// Feed one event to the Manager and execute everything it returns.
    async fn dispatch(&mut self, event: Event) -> Result<(), ServerError> {
        if let Event::ProcessExited { process, .. } = &event {
            self.host.reap(*process);
        }
        let actions = self.manager.handle(event, std::time::Instant::now())?;
        self.apply(actions).await
    }

    /// Execute an action batch, feeding follow-up events (write failures)
    /// back through the Manager until the batch settles.
    async fn apply(&mut self, mut actions: Vec<Action>) -> Result<(), ServerError> {
        loop {
            let followups = self.execute(actions).await;
            if followups.is_empty() {
                return Ok(());
            }
            let now = std::time::Instant::now();
            actions = Vec::new();
            for event in followups {
                actions.extend(self.manager.handle(event, now)?);
            }
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Vec<Event> {
        let mut followups = Vec::new();
        for action in actions {
            match action {
                Action::Send { connection, message } => {
                    if let Some(writer) = self.writers.get_mut(&connection) {
                        if let Err(err) = wire::write_message(writer, &message).await {
                            followups
                                .push(Event::Faulted { connection, reason: err.to_string() });
                        }
                    } else {
                        tracing::debug!(%connection, "send with no transport writer");
                    }
                },
                Action::Close { connection, reason } => {
                    if let Some(mut writer) = self.writers.remove(&connection) {
                        let _ = writer.shutdown().await;
                    }
                    tracing::debug!(%connection, reason = %reason, "transport closed");
                },
                Action::Spawn { process, spec } => self.host.spawn(process, &spec),
                Action::Signal { process } => self.host.signal(process),
                Action::Pipe { from, to } => self.host.pipe(from, to),
                Action::AckJob(job) => self.relay(QueueCommand::Ack(job)),
                Action::NackJob { job, reason } => {
                    self.relay(QueueCommand::Nack { job, reason });
                },
                Action::Log { level, message } => emit_log(level, &message),
            }
        }
        followups
    }

    /// Relay an acknowledgement to the pump without awaiting capacity:
    /// the pump feeds this loop's own event channel, so blocking here can
    /// wedge both tasks. A dropped acknowledgement leaves the job
    /// unacknowledged and the queue redelivers it.
    fn relay(&mut self, command: QueueCommand) {
        match &self.queue_commands {
            Some(sender) => {
                if let Err(err) = sender.try_send(command) {
                    tracing::warn!(%err, "dropping queue acknowledgement");
                }
            },
            None => tracing::warn!(?command, "job acknowledgement without a queue connector"),
        }
    }
}

/// Map a core log action onto `tracing`.
fn emit_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!("{message}"),
        LogLevel::Info => tracing::info!("{message}"),
        LogLevel::Warn => tracing::warn!("{message}"),
        LogLevel::Error => tracing::error!("{message}"),
    }
}

/// Emit the log actions of a batch produced outside the control loop
/// (boot-time wiring). Non-log actions are ignored.
pub fn emit_logs(actions: &[Action]) {
    for action in actions {
        if let Action::Log { level, message } = action {
            emit_log(*level, message);
        }
    }
}

/// Random connection id, like a session id: assigned by the runtime, never
/// reused, meaningless to the core.
///
/// # Panics
///
/// Panics if the OS RNG fails; a server without working randomness cannot
/// assign unguessable ids and must not serve.
fn random_connection_id() -> ConnectionId {
    let mut raw = [0u8; 8];
    #[allow(clippy::expect_used)]
    getrandom::fill(&mut raw).expect("invariant: OS RNG failure is unrecoverable");
    ConnectionId::new(u64::from_be_bytes(raw))
}

/// Per-connection read task: decode frames, post events, stop on EOF.
fn spawn_reader(
    connection: ConnectionId,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<LoopEvent>,
) {
    tokio::spawn(async move {
        loop {
            match wire::read_message(&mut reader).await {
                Ok(message) => {
                    let message = Message::inbound(message.key, message.payload, connection);
                    let event = Event::Received { connection, message };
                    if events.send(LoopEvent::Core(event)).await.is_err() {
                        break;
                    }
                },
                Err(err) if err.is_clean_eof() => {
                    let _ = events.send(LoopEvent::Core(Event::Closed(connection))).await;
                    break;
                },
                Err(err) => {
                    let event = Event::Faulted { connection, reason: err.to_string() };
                    let _ = events.send(LoopEvent::Core(event)).await;
                    break;
                },
            }
        }
    });
}

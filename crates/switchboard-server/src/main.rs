//! Switchboard server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port
//! switchboard-server
//!
//! # Custom bind address and faster ticks
//! switchboard-server --bind 0.0.0.0:7600 --tick-ms 10
//! ```
//!
//! The binary wires a small chat-room setup: a `lobby` topic, a `join`
//! listener that subscribes the sender, and a `say` listener that relays
//! the payload to every lobby subscriber.

use std::time::{Duration, Instant};

use clap::Parser;
use switchboard_core::{from_fn, Manager, ManagerConfig, Message};
use switchboard_server::{emit_logs, Server, ServerRuntimeConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Switchboard pub/sub server
#[derive(Parser, Debug)]
#[command(name = "switchboard-server")]
#[command(about = "Switchboard pub/sub orchestration server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:7600")]
    bind: String,

    /// Control-loop tick interval in milliseconds
    #[arg(long, default_value = "25")]
    tick_ms: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Switchboard server starting");
    tracing::info!("Binding to {}", args.bind);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        tick_interval: Duration::from_millis(args.tick_ms),
        manager: ManagerConfig { max_connections: args.max_connections, ..Default::default() },
    };

    let mut manager = Manager::new(config.manager);
    emit_logs(&manager.boot()?);
    wire_chat_room(&mut manager)?;

    let server = Server::bind(config).await?;
    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run(manager, None).await?;

    Ok(())
}

/// Demo application wiring: one lobby topic with join/say listeners.
fn wire_chat_room(manager: &mut Manager) -> Result<(), Box<dyn std::error::Error>> {
    let now = Instant::now();
    let actions = manager.run(
        from_fn(|ctx| {
            ctx.register("lobby");
            ctx.listen("join", |message| {
                let origin = message.origin;
                from_fn(move |ctx| {
                    if let Some(connection) = origin {
                        ctx.subscribe("lobby", connection)?;
                        ctx.publish("lobby", &Message::new("lobby", "a new peer joined"))?;
                    }
                    Ok(())
                })
            });
            ctx.listen("say", |message| {
                let relay = Message::new("lobby", message.payload.clone());
                from_fn(move |ctx| {
                    ctx.publish("lobby", &relay)?;
                    Ok(())
                })
            });
            Ok(())
        }),
        now,
    )?;
    emit_logs(&actions);
    Ok(())
}

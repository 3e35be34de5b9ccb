//! Server binary.
//!
//! Startup sequence:
//!
//! 1. Parse flags and initialise structured logging.
//! 2. Connect to NATS (configurable URL, default `nats://localhost:4222`).
//! 3. Build and wire the world over the in-memory store.
//! 4. Optionally flush and seed.
//! 5. Start the API gateway and enter the tick loop.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lattice_component::{KvBackend, MemoryBackend};
use lattice_net::{NatsConnection, WorkBus};
use lattice_server::api::Api;
use lattice_server::gateway::Gateway;
use lattice_server::seed;
use lattice_server::world::{World, WorldConfig};

#[derive(Parser)]
#[command(name = "lattice-server", about = "Tick-synchronized grid world server over NATS")]
struct Args {
    /// Vision radius and chunk edge.
    #[arg(long, default_value_t = 15)]
    radius: i64,

    /// Wall-clock milliseconds between ticks.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Clear the KV store at startup, then seed test entities.
    #[arg(long)]
    flush_store: bool,

    /// Number of static `#` entities seeded when flushing.
    #[arg(long, default_value_t = 100)]
    test_entities: u32,

    /// NATS server URL (falls back to NATS_URL, then localhost).
    #[arg(long)]
    nats_url: Option<String>,

    /// Capacity of each per-session stream channel.
    #[arg(long, default_value_t = 64)]
    updater_buffer: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    info!("lattice server starting");

    let conn = match &args.nats_url {
        Some(url) => NatsConnection::connect_to(url).await?,
        None => NatsConnection::connect().await?,
    };

    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
    if args.flush_store {
        backend.flush_all().await?;
    }

    let config = WorldConfig {
        radius: args.radius,
        tick: std::time::Duration::from_millis(args.tick_ms),
        updater_buffer: args.updater_buffer,
    };
    let bus: Arc<dyn WorkBus> = Arc::new(conn.clone());
    let world = World::build(config, backend, bus).await?;

    if args.flush_store {
        seed::seed_test_entities(&world.registry, args.test_entities).await?;
    }

    let api = Arc::new(Api::new(Arc::clone(&world)));
    let gateway = Gateway::new(api, conn.client().clone());
    tokio::spawn(async move {
        if let Err(err) = gateway.run().await {
            error!(error = %err, "gateway terminated");
        }
    });

    world.start();
    info!(
        radius = args.radius,
        tick_ms = args.tick_ms,
        "lattice server running"
    );
    world.clock.run().await;
    Ok(())
}

use clap::Parser;
use log::info;
use server::checkpoint::{CheckpointStore, Checkpointer, MemoryStore};
use server::economy::MemoryEconomy;
use server::engine::RoomEngine;
use server::network::RoomServer;
use server::session::DevTokenIdentity;
use shared::{Catalog, RoomId, RoomState, UserId};
use std::sync::Arc;
use std::time::Duration;

/// Authoritative room server for the shared social-simulation world
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "20")]
    tick_rate: u32,

    /// Room identifier to host
    #[clap(long, default_value = "1")]
    room_id: u64,

    /// User id of the room owner
    #[clap(long, default_value = "1")]
    owner: u64,

    /// Maximum number of concurrent sessions
    #[clap(short, long, default_value = "16")]
    max_sessions: usize,

    /// Grid width of the room
    #[clap(long, default_value = "16")]
    grid_width: u32,

    /// Grid height of the room
    #[clap(long, default_value = "16")]
    grid_height: u32,

    /// Whether guests may interact with farmables and furniture
    #[clap(long, default_value = "true")]
    guest_interaction: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);
    let tick_duration = Duration::from_millis(1000 / args.tick_rate as u64);
    let room = RoomId(args.room_id);
    let owner = UserId(args.owner);

    // Recover from the last durable checkpoint, or start a fresh room with
    // an initial owner grant.
    let mut store = MemoryStore::new();
    let (engine, persisted_revision) = match store.load(room)? {
        Some((mut state, ledger, revision)) => {
            info!("recovered room {} at revision {}", room.0, revision);
            state.guest_interaction_enabled = args.guest_interaction;
            (
                RoomEngine::recover(state, ledger, MemoryEconomy::new(), Catalog::demo()),
                revision,
            )
        }
        None => {
            let mut state = RoomState::new(room, owner, args.grid_width, args.grid_height);
            state.guest_interaction_enabled = args.guest_interaction;
            let mut engine = RoomEngine::new(state, MemoryEconomy::new(), Catalog::demo());
            engine.bootstrap_owner(
                500,
                &[
                    ("carrot_seed".to_string(), 5),
                    ("turnip_seed".to_string(), 5),
                    ("wooden_chair".to_string(), 1),
                ],
            );
            (engine, 0)
        }
    };

    let checkpointer = Checkpointer::new(store, room, persisted_revision);
    let mut server = RoomServer::new(
        &addr,
        engine,
        checkpointer,
        Arc::new(DevTokenIdentity),
        tick_duration,
        args.max_sessions,
    )
    .await?;

    server.run().await
}

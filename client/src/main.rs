use clap::Parser;
use client::network::Client;
use log::info;
use shared::{ActionPayload, GridPos, Rotation};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Join credential (dev scheme: user-<id>)
    #[arg(short = 't', long, default_value = "user-1")]
    token: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Seconds to wait for the planted crop to ripen before harvesting
    #[arg(long, default_value = "61")]
    grow_wait: u64,
}

/// Headless scripted session: join, buy seeds, plant, wait, harvest,
/// place a chair, leave. Useful for exercising a running server by hand.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mut client = Client::new(&args.server, &args.token, args.fake_ping).await?;
    client.join().await?;

    submit(
        &mut client,
        ActionPayload::PurchaseItem {
            item: "turnip_seed".to_string(),
            quantity: 2,
        },
    )
    .await?;
    client.pump(Duration::from_secs(1)).await?;

    let plot = GridPos::new(2, 2);
    submit(
        &mut client,
        ActionPayload::PlantCrop {
            pos: plot,
            seed: "turnip_seed".to_string(),
        },
    )
    .await?;

    info!("waiting {}s for the turnip to ripen", args.grow_wait);
    client.pump(Duration::from_secs(args.grow_wait)).await?;

    submit(&mut client, ActionPayload::HarvestCrop { pos: plot }).await?;
    client.pump(Duration::from_secs(1)).await?;

    submit(
        &mut client,
        ActionPayload::PurchaseItem {
            item: "wooden_chair".to_string(),
            quantity: 1,
        },
    )
    .await?;
    client.pump(Duration::from_secs(1)).await?;

    submit(
        &mut client,
        ActionPayload::PlaceItem {
            item: "wooden_chair".to_string(),
            pos: GridPos::new(5, 5),
            rotation: Rotation::R0,
        },
    )
    .await?;
    client.pump(Duration::from_secs(2)).await?;

    if let Some(reconciler) = client.reconciler() {
        info!(
            "final view: revision={} wallet={} mismatches={} discarded_late={}",
            reconciler.revision(),
            reconciler
                .state()
                .wallets
                .values()
                .copied()
                .next()
                .unwrap_or(0),
            reconciler.mismatches(),
            reconciler.discarded_late(),
        );
    }
    client.leave().await?;
    Ok(())
}

async fn submit(
    client: &mut Client,
    payload: ActionPayload,
) -> Result<(), Box<dyn std::error::Error>> {
    match client.submit(payload.clone()).await? {
        Ok(action_id) => info!("submitted {:?} as {}", payload.kind(), action_id),
        Err(e) => info!("refused locally: {}", e),
    }
    Ok(())
}

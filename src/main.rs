use bytesize::ByteSize;
use color_eyre::eyre::WrapErr;
use tracing_subscriber::EnvFilter;

use scenesync::config;
use scenesync::{Client, SyncEngine, SyncOptions};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    color_eyre::install()?;

    let config = config::config();
    let client = Client::new(&config.client)?.with_product(config.sync.product.clone());
    tracing::debug!(base_url = %client.base_url(), workers = client.dispatcher().workers(), "Client ready");

    let options = SyncOptions::new(&config.sync.destination, config.sync.scene_type.clone())
        .filters(config.sync.filters());
    let mut engine = SyncEngine::new(client, options);

    let remaining = engine
        .init(config.sync.limit)
        .await
        .wrap_err_with(|| format!("Failed to start sync into {}", config.sync.destination.display()))?;
    if remaining == 0 {
        tracing::info!("Nothing new to sync");
    } else {
        tracing::info!("Syncing {} scenes", remaining);
    }

    let summary = engine
        .sync(|id, remaining| println!("{id} done, {remaining} to go"))
        .await?;

    tracing::info!(
        "Synced {} scenes ({})",
        summary.synced,
        ByteSize::b(summary.transferred)
    );
    if let Some(latest) = summary.latest {
        tracing::info!("Newest scene acquired {}", scenesync::util::format_timestamp(&latest));
    }
    Ok(())
}

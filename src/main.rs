use anyhow::{Context, Result};
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod error;
mod sources;
mod ui;

use crate::audio::{frames::ProcessPipeline, registry::SessionRegistry, MusicManager};
use crate::bot::{voice::SongbirdConnector, MusicBot};
use crate::config::Config;
use crate::sources::YtDlpResolver;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mountain_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting Mountain Music v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load()?);

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let songbird = Songbird::serenity();
    let manager = Arc::new(MusicManager::new(
        SessionRegistry::new(config.shutdown_timeout()),
        Arc::new(YtDlpResolver::new(config.extractor_path.clone(), config.resolve_timeout())),
        Arc::new(ProcessPipeline::from_config(&config)),
        Arc::new(SongbirdConnector::new(
            Arc::clone(&songbird),
            config.sink_buffer_frames,
            config.opus_bitrate,
        )),
        config.max_queue_size,
    ));

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = MusicBot::new(Arc::clone(&config), Arc::clone(&manager));

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Graceful shutdown: release every voice session before the gateway goes
    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, closing sessions...");
        manager.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let extractor = async_process::Command::new(&config.extractor_path)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("{} is not installed", config.extractor_path))?;
    if !extractor.status.success() {
        anyhow::bail!("{} --version failed", config.extractor_path);
    }

    // dca has no version flag; starting it is enough
    async_process::Command::new(&config.encoder_path)
        .arg("-h")
        .stdin(async_process::Stdio::null())
        .output()
        .await
        .with_context(|| format!("{} is not installed", config.encoder_path))?;

    println!("OK");
    Ok(())
}

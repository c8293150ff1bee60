use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub command_prefix: String,

    // Queue
    pub max_queue_size: usize,

    // Pipeline
    pub extractor_path: String,
    pub encoder_path: String,
    pub default_volume: f32,
    pub opus_bitrate: u32,
    pub sink_buffer_frames: usize,

    // Timeouts
    pub resolve_timeout_secs: u64,
    pub shutdown_timeout_ms: u64,

    // Permissions
    pub moderator_only_teardown: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Builds a configuration from a key lookup, falling back to
    /// [`Config::default`] for anything unset. Only `DISCORD_TOKEN` is
    /// required.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Ok(Self {
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN must be set")?,
            command_prefix: var("COMMAND_PREFIX").unwrap_or(defaults.command_prefix),

            max_queue_size: parse_or(&var, "MAX_QUEUE_SIZE", defaults.max_queue_size)?,

            extractor_path: var("EXTRACTOR_PATH").unwrap_or(defaults.extractor_path),
            encoder_path: var("ENCODER_PATH").unwrap_or(defaults.encoder_path),
            default_volume: parse_or(&var, "DEFAULT_VOLUME", defaults.default_volume)?,
            opus_bitrate: parse_or(&var, "OPUS_BITRATE", defaults.opus_bitrate)?,
            sink_buffer_frames: parse_or(&var, "SINK_BUFFER_FRAMES", defaults.sink_buffer_frames)?,

            resolve_timeout_secs: parse_or(&var, "RESOLVE_TIMEOUT_SECS", defaults.resolve_timeout_secs)?,
            shutdown_timeout_ms: parse_or(&var, "SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout_ms)?,

            moderator_only_teardown: parse_or(
                &var,
                "MODERATOR_ONLY_TEARDOWN",
                defaults.moderator_only_teardown,
            )?,
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - Opus bitrate must be between 8kbps and 510kbps
    /// - Queue size and sink buffer must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 2.0, got: {}", self.default_volume);
        }

        if self.opus_bitrate > 510000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.sink_buffer_frames == 0 {
            anyhow::bail!("Sink buffer must hold at least one frame");
        }

        Ok(())
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Returns a summary of the current configuration for logging.
    /// The token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Commands: prefix '{}', teardown {}\n  \
            Audio: {}% vol, {}kbps, {} frame buffer\n  \
            Pipeline: {} | {}\n  \
            Limits: {} queue, {} resolve timeout, {} shutdown grace",
            self.command_prefix,
            if self.moderator_only_teardown { "moderators only" } else { "anyone" },
            (self.default_volume * 100.0).round() as u32,
            self.opus_bitrate / 1000,
            self.sink_buffer_frames,
            self.extractor_path,
            self.encoder_path,
            self.max_queue_size,
            humantime::format_duration(self.resolve_timeout()),
            humantime::format_duration(self.shutdown_timeout()),
        )
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (token has no default - must be provided)
            discord_token: String::new(),
            command_prefix: "!music".to_string(),

            max_queue_size: crate::audio::queue::DEFAULT_MAX_QUEUE_SIZE,

            extractor_path: "yt-dlp".to_string(),
            encoder_path: "dca".to_string(),
            default_volume: 1.0,
            opus_bitrate: 96000, // 96kbps (Discord default)
            sink_buffer_frames: 16,

            resolve_timeout_secs: 30,
            shutdown_timeout_ms: 2000,

            moderator_only_teardown: true,
        }
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;

use crate::error::MusicResult;

/// Real-time transport for one guild's encoded audio.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Hands one Opus frame to the transport. May apply backpressure.
    async fn send(&self, frame: Bytes) -> MusicResult<()>;

    /// Brackets every streamed track: `true` before the first frame,
    /// `false` after the last one.
    async fn set_speaking(&self, speaking: bool) -> MusicResult<()>;

    /// Releases the voice connection.
    async fn disconnect(&self) -> MusicResult<()>;
}

/// Obtains a sink for a voice channel.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<Arc<dyn VoiceSink>>;
}

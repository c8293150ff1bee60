use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    frames::FrameSourceFactory,
    registry::SessionRegistry,
    session::{Control, Session, SessionInfo},
    sink::VoiceConnector,
    track::{Requester, Track},
};
use crate::{
    error::{MusicError, MusicResult},
    sources::Resolver,
};

/// Request-handling entry point: every chat command maps onto one method.
///
/// Nothing here blocks on audio I/O. Control commands are queued for the
/// guild's worker and return immediately.
pub struct MusicManager {
    registry: SessionRegistry,
    resolver: Arc<dyn Resolver>,
    frames: Arc<dyn FrameSourceFactory>,
    connector: Arc<dyn VoiceConnector>,
    max_queue_size: usize,
}

impl MusicManager {
    pub fn new(
        registry: SessionRegistry,
        resolver: Arc<dyn Resolver>,
        frames: Arc<dyn FrameSourceFactory>,
        connector: Arc<dyn VoiceConnector>,
        max_queue_size: usize,
    ) -> Self {
        Self {
            registry,
            resolver,
            frames,
            connector,
            max_queue_size,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Connects to `channel_id` and opens an idle session. `None` means the
    /// requesting user is not in a voice channel.
    ///
    /// The guild's slot is claimed before connecting, so a losing join never
    /// touches the winner's voice call.
    pub async fn join(&self, guild_id: GuildId, channel_id: Option<ChannelId>) -> MusicResult<Arc<Session>> {
        let channel_id = channel_id.ok_or(MusicError::NotInVoice)?;
        let reservation = self.registry.reserve(guild_id)?;

        let sink = self.connector.connect(guild_id, channel_id).await.map_err(|e| {
            warn!("Failed to connect to voice in guild {}: {}", guild_id, e);
            e
        })?;
        Ok(reservation.fill(channel_id, self.max_queue_size, sink, Arc::clone(&self.frames)))
    }

    pub async fn leave(&self, guild_id: GuildId) -> MusicResult<()> {
        self.registry.destroy(guild_id).await
    }

    /// Resolves `query` and appends it to the guild's queue.
    pub async fn play(&self, guild_id: GuildId, query: &str, requester: Requester) -> MusicResult<(Track, usize)> {
        let session = self.session(guild_id)?;
        if session.is_full() {
            return Err(MusicError::QueueFull {
                capacity: self.max_queue_size,
            });
        }

        let track = self.resolver.resolve(query, requester).await?;
        let position = session.enqueue(track.clone())?;
        info!("🎶 {} queued at #{} in guild {}", track.title, position, guild_id);
        Ok((track, position))
    }

    pub fn control(&self, guild_id: GuildId, control: Control) -> MusicResult<()> {
        self.session(guild_id)?.control(control)
    }

    pub fn clear(&self, guild_id: GuildId) -> MusicResult<usize> {
        Ok(self.session(guild_id)?.clear())
    }

    pub fn shuffle(&self, guild_id: GuildId) -> MusicResult<()> {
        self.session(guild_id)?.shuffle();
        Ok(())
    }

    pub fn snapshot(&self, guild_id: GuildId) -> MusicResult<SessionInfo> {
        Ok(self.session(guild_id)?.snapshot())
    }

    pub fn now_playing(&self, guild_id: GuildId) -> MusicResult<Option<Track>> {
        Ok(self.session(guild_id)?.current())
    }

    pub async fn shutdown(&self) {
        if self.registry.is_empty() {
            return;
        }
        let active = self.registry.len();
        self.registry.destroy_all().await;
        info!("🛑 Closed {} voice sessions", active);
    }

    fn session(&self, guild_id: GuildId) -> MusicResult<Arc<Session>> {
        self.registry.get(guild_id).ok_or(MusicError::NotActive)
    }
}

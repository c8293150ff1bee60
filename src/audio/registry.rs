use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tracing::info;

use super::{frames::FrameSourceFactory, session::Session, sink::VoiceSink};
use crate::error::{MusicError, MusicResult};

enum Slot {
    /// A join is connecting to voice.
    Joining,
    Active(Arc<Session>),
    /// Being torn down; the guild's voice call still belongs to it.
    Leaving,
}

/// Guild → session map. Owned by the bot and handed to request handlers.
///
/// A guild's slot is claimed before its voice connection is made and only
/// released once the old session has let go of that connection, so two
/// sessions never share one guild's call.
pub struct SessionRegistry {
    sessions: DashMap<GuildId, Slot>,
    shutdown_grace: Duration,
}

impl SessionRegistry {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            shutdown_grace,
        }
    }

    /// Looks up a session; never creates one.
    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Session>> {
        match self.sessions.get(&guild_id)?.value() {
            Slot::Active(session) => Some(Arc::clone(session)),
            Slot::Joining | Slot::Leaving => None,
        }
    }

    /// True while the guild is joining, active or leaving.
    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.sessions.contains_key(&guild_id)
    }

    /// Claims the guild's slot ahead of connecting to voice.
    pub fn reserve(&self, guild_id: GuildId) -> MusicResult<Reservation<'_>> {
        match self.sessions.entry(guild_id) {
            Entry::Occupied(_) => Err(MusicError::AlreadyActive),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Joining);
                Ok(Reservation {
                    registry: self,
                    guild_id,
                    filled: false,
                })
            }
        }
    }

    /// Inserts a new idle session for the guild.
    pub fn create(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        max_queue_size: usize,
        sink: Arc<dyn VoiceSink>,
        frames: Arc<dyn FrameSourceFactory>,
    ) -> MusicResult<Arc<Session>> {
        Ok(self
            .reserve(guild_id)?
            .fill(channel_id, max_queue_size, sink, frames))
    }

    /// Tears the guild's session down, then frees its slot.
    pub async fn destroy(&self, guild_id: GuildId) -> MusicResult<()> {
        let session = {
            let mut slot = self.sessions.get_mut(&guild_id).ok_or(MusicError::NotActive)?;
            match std::mem::replace(slot.value_mut(), Slot::Leaving) {
                Slot::Active(session) => session,
                other => {
                    *slot.value_mut() = other;
                    return Err(MusicError::NotActive);
                }
            }
        };

        // frees the slot even if this future is dropped mid-teardown
        let _release = Reservation {
            registry: self,
            guild_id,
            filled: false,
        };
        session.shutdown(self.shutdown_grace).await;
        Ok(())
    }

    /// Tears down every session, e.g. on process exit.
    pub async fn destroy_all(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            // a concurrent leave may have won the race
            let _ = self.destroy(guild_id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// A claimed guild slot. Dropping it unfilled frees the slot again.
pub struct Reservation<'a> {
    registry: &'a SessionRegistry,
    guild_id: GuildId,
    filled: bool,
}

impl Reservation<'_> {
    pub fn fill(
        mut self,
        channel_id: ChannelId,
        max_queue_size: usize,
        sink: Arc<dyn VoiceSink>,
        frames: Arc<dyn FrameSourceFactory>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(self.guild_id, channel_id, max_queue_size, sink, frames));
        self.registry
            .sessions
            .insert(self.guild_id, Slot::Active(Arc::clone(&session)));
        self.filled = true;
        info!("🔊 Session created for guild {} in channel {}", self.guild_id, channel_id);
        session
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.registry
                .sessions
                .remove_if(&self.guild_id, |_, slot| !matches!(slot, Slot::Active(_)));
        }
    }
}

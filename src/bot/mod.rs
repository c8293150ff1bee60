//! # Bot Module
//!
//! Discord front end for Mountain Music.
//!
//! [`MusicBot`] implements Serenity's [`EventHandler`]: it parses prefix
//! commands out of guild messages, checks who may run them and forwards
//! them to the [`MusicManager`]. Replies are plain text except for the
//! now-playing embed.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Member, Message, Ready, UserId, VoiceState},
    async_trait,
    builder::{CreateMessage, EditMessage},
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod voice;

use self::commands::Command;
use crate::{
    audio::{Control, MusicManager, Requester},
    config::Config,
    error::MusicError,
    ui::embeds,
};

pub struct MusicBot {
    config: Arc<Config>,
    manager: Arc<MusicManager>,
}

impl MusicBot {
    pub fn new(config: Arc<Config>, manager: Arc<MusicManager>) -> Self {
        Self { config, manager }
    }

    /// Runs one parsed command and sends its reply.
    ///
    /// Session errors become replies; only Discord API failures are
    /// returned.
    async fn handle(&self, ctx: &Context, msg: &Message, guild_id: GuildId, command: Command) -> Result<()> {
        let channel = msg.channel_id;

        if command.is_moderator_only()
            && self.config.moderator_only_teardown
            && !self.is_moderator(ctx, msg, guild_id).await
        {
            channel
                .say(ctx, "You need the Manage Channels permission to do that.")
                .await?;
            return Ok(());
        }

        let reply = match command {
            Command::Join => {
                let target = voice_channel_of(ctx, guild_id, msg.author.id);
                match self.manager.join(guild_id, target).await {
                    Ok(session) => format!("Joined <#{}>.", session.channel_id()),
                    Err(e) => e.to_string(),
                }
            }
            Command::Leave => match self.manager.leave(guild_id).await {
                Ok(()) => "Bye!".to_string(),
                Err(e) => e.to_string(),
            },
            Command::Play(query) if query.is_empty() => {
                format!("Usage: `{} play <url or search>`", self.config.command_prefix)
            }
            Command::Play(query) => {
                let typing = channel.start_typing(&ctx.http);
                let result = self.manager.play(guild_id, &query, requester_of(msg)).await;
                typing.stop();
                match result {
                    Ok((track, position)) => {
                        format!("Added **{}** to the queue (position {}).", track.title, position)
                    }
                    Err(MusicError::QueueFull { .. }) => "Can't queue any more tracks right now".to_string(),
                    Err(e) => {
                        warn!("Play failed in guild {}: {}", guild_id, e);
                        e.to_string()
                    }
                }
            }
            Command::Pause => self.control(guild_id, Control::Pause, "Paused."),
            Command::Resume => self.control(guild_id, Control::Resume, "Resumed."),
            Command::Skip => self.control(guild_id, Control::Skip, "Skipped."),
            Command::Stop => self.control(guild_id, Control::Stop, "Stopped."),
            Command::Queue => match self.manager.snapshot(guild_id) {
                Ok(info) => embeds::queue_listing(&info).unwrap_or_else(|| "Nothing in the queue!".to_string()),
                Err(e) => e.to_string(),
            },
            Command::Clear => match self.manager.clear(guild_id) {
                Ok(1) => "Removed 1 track from the queue.".to_string(),
                Ok(n) => format!("Removed {n} tracks from the queue."),
                Err(e) => e.to_string(),
            },
            Command::Shuffle => {
                let mut progress = channel.say(ctx, "Shuffling...").await?;
                let done = match self.manager.shuffle(guild_id) {
                    Ok(()) => "Shuffled!".to_string(),
                    Err(e) => e.to_string(),
                };
                progress.edit(ctx, EditMessage::new().content(done)).await?;
                return Ok(());
            }
            Command::NowPlaying => match self.manager.now_playing(guild_id) {
                Ok(Some(track)) => {
                    channel
                        .send_message(ctx, CreateMessage::new().embed(embeds::now_playing_embed(&track)))
                        .await?;
                    return Ok(());
                }
                Ok(None) => "Nothing is playing right now.".to_string(),
                Err(e) => e.to_string(),
            },
            Command::Help => commands::help_text(&self.config.command_prefix),
            Command::Unknown(name) => format!(
                "Unknown command `{}`. Try `{} help`.",
                name, self.config.command_prefix
            ),
        };

        channel.say(ctx, reply).await?;
        Ok(())
    }

    fn control(&self, guild_id: GuildId, control: Control, done: &str) -> String {
        match self.manager.control(guild_id, control) {
            Ok(()) => done.to_string(),
            Err(e) => e.to_string(),
        }
    }

    async fn is_moderator(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> bool {
        match msg.member(ctx).await {
            Ok(member) => can_manage_channels(ctx, guild_id, msg.channel_id, &member),
            Err(e) => {
                warn!("Could not load member {} for permission check: {}", msg.author.id, e);
                false
            }
        }
    }
}

fn requester_of(msg: &Message) -> Requester {
    let requester = Requester::new(msg.author.id, msg.author.name.clone());
    match msg.author.avatar_url() {
        Some(avatar) => requester.with_avatar(avatar),
        None => requester,
    }
}

fn voice_channel_of(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild.voice_states.get(&user_id).and_then(|state| state.channel_id)
}

fn can_manage_channels(ctx: &Context, guild_id: GuildId, channel_id: ChannelId, member: &Member) -> bool {
    let Some(guild) = guild_id.to_guild_cached(&ctx.cache) else {
        return false;
    };
    guild
        .channels
        .get(&channel_id)
        .is_some_and(|channel| guild.user_permissions_in(channel, member).manage_channels())
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let Some(command) = commands::parse(&self.config.command_prefix, &msg.content) else {
            return;
        };

        debug!("Command {} from {} in guild {}", command, msg.author.name, guild_id);
        if let Err(e) = self.handle(&ctx, &msg, guild_id, command).await {
            error!("Failed to answer command in guild {}: {:?}", guild_id, e);
        }
    }

    /// Drops the session when the bot is disconnected from voice by
    /// someone else.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        match self.manager.leave(guild_id).await {
            Ok(()) => info!("🔌 Disconnected from voice in guild {}, session closed", guild_id),
            Err(MusicError::NotActive) => {}
            Err(e) => warn!("Failed to close session for guild {}: {}", guild_id, e),
        }
    }
}

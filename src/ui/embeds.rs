use chrono::{DateTime, Utc};
use serenity::builder::{CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter};
use std::{fmt::Write, time::Duration};

use crate::audio::{SessionInfo, Track};

/// Queued entries listed before the rest collapse into "And N more".
const QUEUE_PAGE_SIZE: usize = 10;

pub mod colors {
    use serenity::all::Colour;

    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
}

/// Embed for the track that is currently playing.
pub fn now_playing_embed(track: &Track) -> CreateEmbed {
    let requester = &track.requested_by;
    let mut author = CreateEmbedAuthor::new(format!("Added by {}", requester.name));
    if let Some(avatar) = &requester.avatar_url {
        author = author.icon_url(avatar);
    }

    let mut embed = CreateEmbed::default()
        .title(&track.title)
        .url(&track.url)
        .author(author)
        .colour(colors::MUSIC_PURPLE)
        .footer(CreateEmbedFooter::new(play_time(track)));

    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }

    embed
}

/// `Play time: elapsed / total`, with elapsed derived from what is left.
pub fn play_time(track: &Track) -> String {
    format!(
        "Play time: {} / {}",
        format_duration(track.elapsed()),
        format_duration(track.duration)
    )
}

/// Plain-text queue listing, or `None` when there is nothing to show.
pub fn queue_listing(info: &SessionInfo) -> Option<String> {
    queue_listing_at(info, Utc::now())
}

fn queue_listing_at(info: &SessionInfo, now: DateTime<Utc>) -> Option<String> {
    if info.current.is_none() && info.queued.is_empty() {
        return None;
    }

    let mut out = String::new();
    if let Some(current) = &info.current {
        let _ = writeln!(
            out,
            "`Now playing`  **{}** added by **{}**\n",
            current.title, current.requested_by.name
        );
    }

    for (i, track) in info.queued.iter().take(QUEUE_PAGE_SIZE).enumerate() {
        let _ = writeln!(
            out,
            "`{}`  **{}** added by **{}**, waiting {}",
            i + 1,
            track.title,
            track.requested_by.name,
            humantime::format_duration(track.waiting_since(now))
        );
    }

    let rest = info.queued.len().saturating_sub(QUEUE_PAGE_SIZE);
    if rest > 0 {
        let _ = write!(out, "And {rest} more");
    }

    Some(out.trim_end().to_string())
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

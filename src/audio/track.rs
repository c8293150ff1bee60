use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::time::Duration;

/// Who asked for a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl Requester {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: String) -> Self {
        self.avatar_url = Some(avatar_url);
        self
    }
}

/// One playable item plus its runtime progress.
///
/// `remaining` is only meaningful while the track is the session's current
/// track; the worker rewrites it on every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub requested_by: Requester,
    pub id: String,
    pub title: String,
    pub url: String,
    pub thumbnail: Option<String>,
    pub duration: Duration,
    pub remaining: Duration,
    pub added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        duration: Duration,
        requested_by: Requester,
    ) -> Self {
        Self {
            requested_by,
            id: id.into(),
            title: title.into(),
            url: url.into(),
            thumbnail: None,
            duration,
            remaining: duration,
            added_at: Utc::now(),
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: String) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    /// Play time so far, derived from the remaining duration.
    pub fn elapsed(&self) -> Duration {
        self.duration.saturating_sub(self.remaining)
    }

    /// Whole seconds since the track was queued, as of `now`.
    pub fn waiting_since(&self, now: DateTime<Utc>) -> Duration {
        let waited = (now - self.added_at).num_seconds().max(0);
        Duration::from_secs(waited as u64)
    }

    pub(crate) fn update_progress(&mut self, played: Duration) {
        self.remaining = self.duration.saturating_sub(played);
    }
}

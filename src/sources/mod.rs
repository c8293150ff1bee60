//! Track resolution: turning a user query into a playable [`Track`].

pub mod ytdlp;

use async_trait::async_trait;

use crate::{
    audio::track::{Requester, Track},
    error::MusicResult,
};

pub use ytdlp::YtDlpResolver;

/// Resolves a direct media URL or a free-text search term into a track.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, query: &str, requester: Requester) -> MusicResult<Track>;
}

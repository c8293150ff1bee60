use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{process::Stdio, sync::LazyLock, time::Duration};
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use super::Resolver;
use crate::{
    audio::track::{Requester, Track},
    error::{MusicError, MusicResult},
};

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<?(https?://)?((www\.)?youtube\.com|youtu\.?be)/.+>?$").expect("valid url pattern")
});

/// Resolves queries by asking `yt-dlp` for a JSON description of the media.
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

/// The subset of `yt-dlp -j` output a track needs.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: String,
    title: String,
    webpage_url: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Checks if the query points at a recognised source.
    pub fn is_youtube_url(query: &str) -> bool {
        URL_PATTERN.is_match(query)
    }

    /// Turns user input into an argument for yt-dlp: a normalised URL for
    /// links, a single-result search otherwise.
    pub fn normalize_query(query: &str) -> MusicResult<String> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MusicError::NotFound(String::new()));
        }

        if !Self::is_youtube_url(query) {
            return Ok(format!("ytsearch1:{query}"));
        }

        let link = query.trim_start_matches('<').trim_end_matches('>');
        let link = if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else {
            format!("https://{link}")
        };
        let parsed = Url::parse(&link).map_err(|e| MusicError::ResolveFailed(format!("invalid url: {e}")))?;
        Ok(parsed.to_string())
    }

    fn parse_output(stdout: &str, requester: Requester) -> Option<Track> {
        stdout.lines().filter(|line| !line.trim().is_empty()).find_map(|line| {
            match serde_json::from_str::<VideoInfo>(line) {
                Ok(info) => Some(Self::into_track(info, requester.clone())),
                Err(e) => {
                    warn!("Skipping unreadable yt-dlp entry: {}", e);
                    None
                }
            }
        })
    }

    fn into_track(info: VideoInfo, requester: Requester) -> Track {
        let url = info
            .webpage_url
            .unwrap_or_else(|| format!("https://youtube.com/watch?v={}", info.id));
        let duration = info
            .duration
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default();

        let track = Track::new(info.id, info.title, url, Duration::from_secs(duration.as_secs()), requester);
        match info.thumbnail {
            Some(thumbnail) => track.with_thumbnail(thumbnail),
            None => track,
        }
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, query: &str, requester: Requester) -> MusicResult<Track> {
        let target = Self::normalize_query(query)?;
        info!("🔍 Resolving {}", target);

        let output = Command::new(&self.binary)
            .args(["-j", "--no-playlist", "--skip-download", "--quiet", "--no-warnings"])
            .arg(&target)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(MusicError::ResolveFailed(format!("failed to start {}: {e}", self.binary))),
            Err(_) => {
                return Err(MusicError::ResolveFailed(format!(
                    "{} timed out after {}",
                    self.binary,
                    humantime::format_duration(self.timeout)
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(track) = Self::parse_output(&stdout, requester) {
            debug!("Resolved {} to {} ({})", query, track.title, track.url);
            return Ok(track);
        }

        if output.status.success() {
            Err(MusicError::NotFound(query.trim().to_string()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp failed for {}: {}", target, stderr.trim());
            Err(MusicError::ResolveFailed(format!("yt-dlp exited with {}", output.status)))
        }
    }
}

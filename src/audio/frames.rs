//! Frame sources: the external-process pipeline that turns a track URL into
//! length-prefixed Opus frames.
//!
//! The pipeline is two chained processes. The extractor (`yt-dlp`) writes the
//! best audio stream to stdout, which is wired straight into the encoder's
//! stdin (`dca -raw`). The encoder emits DCA0 framing: a little-endian `i16`
//! byte length followed by that many bytes of Opus.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::process::Stdio;
use tokio::{
    io::{AsyncRead, AsyncReadExt, BufReader},
    process::{Child, ChildStdout, Command},
};
use tracing::{debug, info, warn};

use super::track::Track;
use crate::{
    config::Config,
    error::{MusicError, MusicResult},
};

const PIPE_BUFFER_SIZE: usize = 16 * 1024;

/// Pull interface over a stream of encoded frames.
///
/// Every source handed out by [`FrameSourceFactory::open`] must see exactly
/// one `close` on every exit path. `close` must not block on process exit.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, `Ok(None)` on end of stream.
    async fn next_frame(&mut self) -> MusicResult<Option<Bytes>>;

    fn close(&mut self);
}

#[async_trait]
pub trait FrameSourceFactory: Send + Sync {
    async fn open(&self, track: &Track) -> MusicResult<Box<dyn FrameSource>>;
}

/// Parses DCA0 framing out of any byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(PIPE_BUFFER_SIZE, inner),
        }
    }

    /// Reads one length prefix and the frame behind it. A short read at the
    /// end of input is end of stream, not an error.
    pub async fn read_frame(&mut self) -> MusicResult<Option<Bytes>> {
        let mut prefix = [0u8; 2];
        if !read_or_eof(&mut self.inner, &mut prefix).await? {
            return Ok(None);
        }

        let len = i16::from_le_bytes(prefix);
        if len <= 0 {
            return Err(MusicError::DecodeFailed(format!(
                "invalid frame length {len}"
            )));
        }

        let mut frame = BytesMut::zeroed(len as usize);
        if !read_or_eof(&mut self.inner, &mut frame).await? {
            return Ok(None);
        }
        Ok(Some(frame.freeze()))
    }
}

async fn read_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> MusicResult<bool> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(MusicError::DecodeFailed(e.to_string())),
    }
}

/// Command lines for the two pipeline stages.
#[derive(Debug, Clone)]
pub struct ProcessPipeline {
    extractor: String,
    extractor_args: Vec<String>,
    encoder: String,
    encoder_args: Vec<String>,
}

impl ProcessPipeline {
    /// The track URL is appended to `extractor_args`.
    pub fn new(
        extractor: impl Into<String>,
        extractor_args: Vec<String>,
        encoder: impl Into<String>,
        encoder_args: Vec<String>,
    ) -> Self {
        Self {
            extractor: extractor.into(),
            extractor_args,
            encoder: encoder.into(),
            encoder_args,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let volume = (config.default_volume * 256.0).round() as u32;
        let bitrate_kbps = config.opus_bitrate / 1000;
        Self::new(
            config.extractor_path.clone(),
            ["-f", "bestaudio", "-o", "-", "--no-playlist", "--quiet"]
                .map(String::from)
                .to_vec(),
            config.encoder_path.clone(),
            vec![
                "-raw".to_string(),
                "-vol".to_string(),
                volume.to_string(),
                "-ab".to_string(),
                bitrate_kbps.to_string(),
                "-i".to_string(),
                "pipe:0".to_string(),
            ],
        )
    }

    pub fn encoder_args(&self) -> &[String] {
        &self.encoder_args
    }

    fn spawn(&self, url: &str) -> MusicResult<ProcessFrameSource> {
        let mut extractor = Command::new(&self.extractor)
            .args(&self.extractor_args)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MusicError::ResolveFailed(format!("failed to start {}: {e}", self.extractor)))?;

        let wired = extractor
            .stdout
            .take()
            .map(|stdout| -> std::io::Result<Stdio> { stdout.try_into() });
        let audio = match wired {
            Some(Ok(stdio)) => stdio,
            Some(Err(e)) => {
                reap("extractor", extractor);
                return Err(MusicError::ResolveFailed(format!("failed to wire extractor output: {e}")));
            }
            None => {
                reap("extractor", extractor);
                return Err(MusicError::ResolveFailed("extractor has no stdout".to_string()));
            }
        };

        let mut encoder = match Command::new(&self.encoder)
            .args(&self.encoder_args)
            .stdin(audio)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                reap("extractor", extractor);
                return Err(MusicError::ResolveFailed(format!("failed to start {}: {e}", self.encoder)));
            }
        };

        let Some(stdout) = encoder.stdout.take() else {
            reap("encoder", encoder);
            reap("extractor", extractor);
            return Err(MusicError::ResolveFailed("encoder has no stdout".to_string()));
        };

        Ok(ProcessFrameSource {
            reader: FrameReader::new(stdout),
            extractor: Some(extractor),
            encoder: Some(encoder),
        })
    }
}

#[async_trait]
impl FrameSourceFactory for ProcessPipeline {
    async fn open(&self, track: &Track) -> MusicResult<Box<dyn FrameSource>> {
        info!("🎧 Opening pipeline for {} ({})", track.title, track.url);
        let source = self.spawn(&track.url)?;
        Ok(Box::new(source))
    }
}

/// A running extractor + encoder pair.
pub struct ProcessFrameSource {
    reader: FrameReader<ChildStdout>,
    extractor: Option<Child>,
    encoder: Option<Child>,
}

#[async_trait]
impl FrameSource for ProcessFrameSource {
    async fn next_frame(&mut self) -> MusicResult<Option<Bytes>> {
        self.reader.read_frame().await
    }

    fn close(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            reap("encoder", encoder);
        }
        if let Some(extractor) = self.extractor.take() {
            reap("extractor", extractor);
        }
    }
}

impl Drop for ProcessFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Kills a child and waits for it on a detached task.
fn reap(name: &'static str, mut child: Child) {
    if let Err(e) = child.start_kill() {
        debug!("{} already exited: {}", name, e);
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!("🧹 {} reaped ({})", name, status),
                    Err(e) => warn!("Failed to reap {}: {}", name, e),
                }
            });
        }
        // kill_on_drop covers the kill; tokio's orphan queue reaps it
        Err(_) => drop(child),
    }
}

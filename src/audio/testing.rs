//! In-memory stand-ins for the voice transport and the process pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{
    frames::{FrameSource, FrameSourceFactory},
    sink::{VoiceConnector, VoiceSink},
    track::{Requester, Track},
};
use crate::error::{MusicError, MusicResult};

pub fn track(title: &str, secs: u64) -> Track {
    Track::new(
        title,
        title,
        format!("https://youtube.com/watch?v={title}"),
        Duration::from_secs(secs),
        Requester::new(UserId::new(42), "tester"),
    )
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<Bytes>>,
    pub speaking: Mutex<Vec<bool>>,
    pub disconnected: AtomicBool,
    pub frame_delay: Duration,
    /// `set_speaking(false)` records the call and then never returns.
    pub stall_on_release: bool,
}

impl RecordingSink {
    pub fn paced(frame_delay: Duration) -> Self {
        Self {
            frame_delay,
            ..Self::default()
        }
    }

    pub fn stalling_on_release() -> Self {
        Self {
            stall_on_release: true,
            ..Self::default()
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn frames_as_strings(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }
}

#[async_trait]
impl VoiceSink for RecordingSink {
    async fn send(&self, frame: Bytes) -> MusicResult<()> {
        if !self.frame_delay.is_zero() {
            tokio::time::sleep(self.frame_delay).await;
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn set_speaking(&self, speaking: bool) -> MusicResult<()> {
        self.speaking.lock().push(speaking);
        if !speaking && self.stall_on_release {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> MusicResult<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub enum Script {
    Frames(usize),
    FailOpen,
    FailAfter(usize),
}

/// Frame source factory driven by per-title scripts. Frames are
/// `"<title>:<n>"`. Unknown titles get `Frames(3)`.
#[derive(Default)]
pub struct ScriptedFrames {
    scripts: Mutex<HashMap<String, Script>>,
    pub events: Arc<Mutex<Vec<String>>>,
    pub open: Arc<AtomicUsize>,
    pub max_open: Arc<AtomicUsize>,
}

impl ScriptedFrames {
    pub fn with(self, title: &str, script: Script) -> Self {
        self.scripts.lock().insert(title.to_string(), script);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[async_trait]
impl FrameSourceFactory for ScriptedFrames {
    async fn open(&self, track: &Track) -> MusicResult<Box<dyn FrameSource>> {
        let script = self
            .scripts
            .lock()
            .get(&track.title)
            .copied()
            .unwrap_or(Script::Frames(3));

        if let Script::FailOpen = script {
            self.events.lock().push(format!("fail {}", track.title));
            return Err(MusicError::ResolveFailed(format!("cannot open {}", track.title)));
        }

        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);
        self.events.lock().push(format!("open {}", track.title));

        let (total, fail_after) = match script {
            Script::Frames(n) => (n, None),
            Script::FailAfter(n) => (usize::MAX, Some(n)),
            Script::FailOpen => unreachable!(),
        };

        Ok(Box::new(ScriptedSource {
            title: track.title.clone(),
            next: 0,
            total,
            fail_after,
            closed: false,
            events: Arc::clone(&self.events),
            open: Arc::clone(&self.open),
        }))
    }
}

struct ScriptedSource {
    title: String,
    next: usize,
    total: usize,
    fail_after: Option<usize>,
    closed: bool,
    events: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> MusicResult<Option<Bytes>> {
        assert!(!self.closed, "frame requested after close");
        tokio::task::yield_now().await;

        if self.fail_after == Some(self.next) {
            return Err(MusicError::DecodeFailed("broken pipe".to_string()));
        }
        if self.next >= self.total {
            return Ok(None);
        }
        let frame = format!("{}:{}", self.title, self.next);
        self.next += 1;
        Ok(Some(Bytes::from(frame)))
    }

    fn close(&mut self) {
        assert!(!self.closed, "frame source closed twice");
        self.closed = true;
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().push(format!("close {}", self.title));
    }
}

/// Connector handing out a fresh `RecordingSink` per connection.
#[derive(Default)]
pub struct RecordingConnector {
    pub sinks: Mutex<Vec<(GuildId, ChannelId, Arc<RecordingSink>)>>,
    pub frame_delay: Duration,
}

impl RecordingConnector {
    pub fn paced(frame_delay: Duration) -> Self {
        Self {
            frame_delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl VoiceConnector for RecordingConnector {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<Arc<dyn VoiceSink>> {
        let sink = Arc::new(RecordingSink::paced(self.frame_delay));
        self.sinks.lock().push((guild_id, channel_id, Arc::clone(&sink)));
        Ok(sink)
    }
}

/// Connector that behaves like songbird: a guild has at most one call, and
/// any sink's `disconnect` drops whichever call the guild has right now.
#[derive(Default)]
pub struct SharedCallConnector {
    calls: Arc<Mutex<HashMap<GuildId, usize>>>,
    next_call: AtomicUsize,
    pub connects: AtomicUsize,
    pub connect_delay: Duration,
    pub disconnect_delay: Duration,
}

impl SharedCallConnector {
    pub fn with_delays(connect_delay: Duration, disconnect_delay: Duration) -> Self {
        Self {
            connect_delay,
            disconnect_delay,
            ..Self::default()
        }
    }

    pub fn is_connected(&self, guild_id: GuildId) -> bool {
        self.calls.lock().contains_key(&guild_id)
    }
}

#[async_trait]
impl VoiceConnector for SharedCallConnector {
    async fn connect(&self, guild_id: GuildId, _channel_id: ChannelId) -> MusicResult<Arc<dyn VoiceSink>> {
        tokio::time::sleep(self.connect_delay).await;
        self.connects.fetch_add(1, Ordering::SeqCst);
        let call = self.next_call.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().insert(guild_id, call);
        Ok(Arc::new(SharedCallSink {
            guild_id,
            calls: Arc::clone(&self.calls),
            disconnect_delay: self.disconnect_delay,
        }))
    }
}

struct SharedCallSink {
    guild_id: GuildId,
    calls: Arc<Mutex<HashMap<GuildId, usize>>>,
    disconnect_delay: Duration,
}

#[async_trait]
impl VoiceSink for SharedCallSink {
    async fn send(&self, _frame: Bytes) -> MusicResult<()> {
        Ok(())
    }

    async fn set_speaking(&self, _speaking: bool) -> MusicResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> MusicResult<()> {
        tokio::time::sleep(self.disconnect_delay).await;
        self.calls.lock().remove(&self.guild_id);
        Ok(())
    }
}

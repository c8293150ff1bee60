//! Voice transport over songbird.
//!
//! Frames coming out of the playback worker are pushed through a bounded
//! channel into a live songbird input that renders them as a DCA1 stream.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{AudioStream, Input, LiveInput},
    Call, Songbird,
};
use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::{io::MediaSource, probe::Hint};
use tracing::{debug, info, warn};

use crate::{
    audio::sink::{VoiceConnector, VoiceSink},
    error::{MusicError, MusicResult},
};

/// Opus packet for 20ms of silence.
const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Joins voice channels through the shared songbird manager.
pub struct SongbirdConnector {
    manager: Arc<Songbird>,
    buffer_frames: usize,
    bitrate: u32,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>, buffer_frames: usize, bitrate: u32) -> Self {
        Self {
            manager,
            buffer_frames,
            bitrate,
        }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> MusicResult<Arc<dyn VoiceSink>> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| MusicError::Transport(format!("failed to join voice channel: {e}")))?;

        info!("🔊 Connected to voice channel {} in guild {}", channel_id, guild_id);
        Ok(Arc::new(SongbirdSink {
            manager: Arc::clone(&self.manager),
            guild_id,
            call,
            buffer_frames: self.buffer_frames,
            bitrate: self.bitrate,
            frames: Mutex::new(None),
        }))
    }
}

/// One guild's voice connection.
///
/// Each speaking period gets its own songbird track; `set_speaking(false)`
/// closes the channel and lets that track drain and end.
pub struct SongbirdSink {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    call: Arc<tokio::sync::Mutex<Call>>,
    buffer_frames: usize,
    bitrate: u32,
    frames: Mutex<Option<flume::Sender<Bytes>>>,
}

#[async_trait]
impl VoiceSink for SongbirdSink {
    async fn send(&self, frame: Bytes) -> MusicResult<()> {
        let tx = self
            .frames
            .lock()
            .clone()
            .ok_or_else(|| MusicError::Transport("not speaking".to_string()))?;

        tx.send_async(frame)
            .await
            .map_err(|_| MusicError::Transport("voice track ended".to_string()))
    }

    async fn set_speaking(&self, speaking: bool) -> MusicResult<()> {
        if !speaking {
            self.frames.lock().take();
            return Ok(());
        }

        let (tx, rx) = flume::bounded(self.buffer_frames);
        *self.frames.lock() = Some(tx);

        let mut hint = Hint::new();
        hint.with_extension("dca");
        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: Box::new(DcaStream::new(rx, self.bitrate)) as Box<dyn MediaSource>,
                hint: Some(hint),
            }),
            None,
        );

        let mut call = self.call.lock().await;
        call.play_only_input(input);
        debug!("Started voice track in guild {}", self.guild_id);
        Ok(())
    }

    async fn disconnect(&self) -> MusicResult<()> {
        self.frames.lock().take();
        // songbird keeps one call per guild; a newer session may own it now
        let owns_call = self
            .manager
            .get(self.guild_id)
            .is_some_and(|call| Arc::ptr_eq(&call, &self.call));
        if !owns_call {
            debug!("Voice call for guild {} already replaced, leaving it alone", self.guild_id);
            return Ok(());
        }
        if let Err(e) = self.manager.remove(self.guild_id).await {
            warn!("Voice disconnect failed in guild {}: {}", self.guild_id, e);
            return Err(MusicError::Transport(e.to_string()));
        }
        info!("👋 Left voice in guild {}", self.guild_id);
        Ok(())
    }
}

/// Blocking byte view of the frame channel: a DCA1 header followed by
/// length-prefixed Opus packets. Reads never wait; an empty channel yields
/// a silence packet and a closed, drained channel is end of stream.
struct DcaStream {
    frames: flume::Receiver<Bytes>,
    pending: Bytes,
    ended: bool,
}

impl DcaStream {
    fn new(frames: flume::Receiver<Bytes>, bitrate: u32) -> Self {
        Self {
            frames,
            pending: dca_header(bitrate),
            ended: false,
        }
    }

    fn refill(&mut self) {
        let frame = match self.frames.try_recv() {
            Ok(frame) => frame,
            Err(flume::TryRecvError::Empty) => Bytes::from_static(&SILENCE_FRAME),
            Err(flume::TryRecvError::Disconnected) => {
                self.ended = true;
                return;
            }
        };

        let Ok(len) = i16::try_from(frame.len()) else {
            warn!("Dropping oversized opus packet ({} bytes)", frame.len());
            return;
        };
        let mut out = BytesMut::with_capacity(frame.len() + 2);
        out.put_i16_le(len);
        out.put_slice(&frame);
        self.pending = out.freeze();
    }
}

impl Read for DcaStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() && !self.ended {
            self.refill();
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

impl Seek for DcaStream {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "live voice stream"))
    }
}

impl MediaSource for DcaStream {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

fn dca_header(bitrate: u32) -> Bytes {
    let metadata = serde_json::json!({
        "dca": {
            "version": 1,
            "tool": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        },
        "opus": {
            "mode": "music",
            "sample_rate": 48000,
            "frame_size": 960,
            "abr": bitrate,
            "vbr": true,
            "channels": 2,
        },
    });
    let json = metadata.to_string();

    let mut out = BytesMut::with_capacity(json.len() + 8);
    out.put_slice(b"DCA1");
    out.put_u32_le(json.len() as u32);
    out.put_slice(json.as_bytes());
    out.freeze()
}

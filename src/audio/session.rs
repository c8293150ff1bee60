use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    frames::FrameSourceFactory,
    player::PlaybackWorker,
    queue::TrackQueue,
    sink::VoiceSink,
    track::Track,
};
use crate::error::{MusicError, MusicResult};

/// Out-of-band instructions for the playback worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Skip,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Streaming,
    Paused,
    Draining,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerState::Idle => "idle",
            PlayerState::Streaming => "streaming",
            PlayerState::Paused => "paused",
            PlayerState::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of a session, taken under its lock.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub current: Option<Track>,
    pub queued: Vec<Track>,
    pub state: PlayerState,
    pub capacity: usize,
}

#[derive(Debug)]
struct SessionState {
    queue: TrackQueue,
    current: Option<Track>,
    player_state: PlayerState,
    /// Set by `Stop`; the worker will not dequeue until it is released.
    held: bool,
    worker: Option<JoinHandle<()>>,
}

/// Playback context of one guild.
pub struct Session {
    guild_id: GuildId,
    channel_id: ChannelId,
    state: Mutex<SessionState>,
    control_tx: Mutex<Option<flume::Sender<Control>>>,
    control_rx: flume::Receiver<Control>,
    wake: Notify,
    shutdown: CancellationToken,
    sink: Arc<dyn VoiceSink>,
    frames: Arc<dyn FrameSourceFactory>,
}

impl Session {
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        max_queue_size: usize,
        sink: Arc<dyn VoiceSink>,
        frames: Arc<dyn FrameSourceFactory>,
    ) -> Self {
        let (control_tx, control_rx) = flume::unbounded();
        Self {
            guild_id,
            channel_id,
            state: Mutex::new(SessionState {
                queue: TrackQueue::new(max_queue_size),
                current: None,
                player_state: PlayerState::Idle,
                held: false,
                worker: None,
            }),
            control_tx: Mutex::new(Some(control_tx)),
            control_rx,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            sink,
            frames,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Appends a track and returns its queue position (1-indexed, current
    /// excluded). Starts the worker if none is running yet.
    pub fn enqueue(self: &Arc<Self>, track: Track) -> MusicResult<usize> {
        let position = {
            let mut state = self.state.lock();
            if self.is_shut_down() {
                return Err(MusicError::NotActive);
            }

            let position = state.queue.enqueue(track)?;
            state.held = false;

            let needs_worker = state.worker.as_ref().map_or(true, |w| w.is_finished());
            if needs_worker {
                info!("🚀 Starting playback worker for guild {}", self.guild_id);
                let worker = PlaybackWorker::new(Arc::clone(self));
                state.worker = Some(tokio::spawn(worker.run()));
            }
            position
        };

        self.wake.notify_one();
        Ok(position)
    }

    pub fn clear(&self) -> usize {
        self.state.lock().queue.clear()
    }

    pub fn shuffle(&self) {
        self.state.lock().queue.shuffle();
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().queue.is_full()
    }

    pub fn current(&self) -> Option<Track> {
        self.state.lock().current.clone()
    }

    pub fn player_state(&self) -> PlayerState {
        self.state.lock().player_state
    }

    pub fn snapshot(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            current: state.current.clone(),
            queued: state.queue.tracks(),
            state: state.player_state,
            capacity: state.queue.capacity(),
        }
    }

    /// Sends a control message to the worker. Never blocks.
    pub fn control(&self, control: Control) -> MusicResult<()> {
        let tx = self.control_tx.lock();
        let tx = tx.as_ref().ok_or(MusicError::NotActive)?;
        tx.send(control).map_err(|_| MusicError::NotActive)?;
        debug!("🎛️ {:?} sent to guild {}", control, self.guild_id);
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops the worker, releases its pipeline and the voice sink.
    ///
    /// Waits up to `grace` for the worker to drain; past that the worker task
    /// is aborted, which drops (and so closes) any open frame source.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.control_tx.lock().take();
        self.wake.notify_one();

        let worker = self.state.lock().worker.take();
        if let Some(mut worker) = worker {
            match tokio::time::timeout(grace, &mut worker).await {
                Ok(Ok(())) => debug!("Worker for guild {} drained", self.guild_id),
                Ok(Err(e)) => warn!("Worker for guild {} ended abnormally: {}", self.guild_id, e),
                Err(_) => {
                    warn!("⚠️ Worker for guild {} did not drain in {:?}, aborting", self.guild_id, grace);
                    worker.abort();
                    // resolves once the task is dropped, which closes its source
                    let _ = worker.await;
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.current = None;
            state.player_state = PlayerState::Draining;
        }

        if let Err(e) = self.sink.disconnect().await {
            warn!("Failed to release voice sink for guild {}: {}", self.guild_id, e);
        }
        info!("👋 Session for guild {} torn down", self.guild_id);
    }

    // Worker-side accessors

    pub(crate) fn control_rx(&self) -> &flume::Receiver<Control> {
        &self.control_rx
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn wake(&self) -> &Notify {
        &self.wake
    }

    pub(crate) fn sink(&self) -> &Arc<dyn VoiceSink> {
        &self.sink
    }

    pub(crate) fn frames(&self) -> &Arc<dyn FrameSourceFactory> {
        &self.frames
    }

    /// Dequeues the head and marks it current, unless the session is held.
    pub(crate) fn begin_next(&self) -> Option<Track> {
        let mut state = self.state.lock();
        if state.held {
            return None;
        }
        let track = state.queue.dequeue()?;
        state.current = Some(track.clone());
        Some(track)
    }

    pub(crate) fn finish_current(&self) {
        let mut state = self.state.lock();
        state.current = None;
        if state.player_state != PlayerState::Draining {
            state.player_state = PlayerState::Idle;
        }
    }

    pub(crate) fn set_player_state(&self, player_state: PlayerState) {
        self.state.lock().player_state = player_state;
    }

    pub(crate) fn update_progress(&self, played: Duration) {
        if let Some(current) = self.state.lock().current.as_mut() {
            current.update_progress(played);
        }
    }

    pub(crate) fn hold(&self) {
        self.state.lock().held = true;
    }

    pub(crate) fn release(&self) -> bool {
        std::mem::replace(&mut self.state.lock().held, false)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("state", &self.state.lock().player_state)
            .finish()
    }
}

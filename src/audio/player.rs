use flume::TryRecvError;
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, info, warn};

use super::{
    frames::FrameSource,
    session::{Control, PlayerState, Session},
    track::Track,
};
use crate::error::MusicError;

/// How a single track's stream ended.
#[derive(Debug)]
enum StreamEnd {
    Finished,
    Skipped,
    Stopped,
    Failed(MusicError),
    Shutdown,
}

/// How a pause ended.
enum PauseEnd {
    Resumed,
    Skipped,
    Stopped,
    Shutdown,
}

/// Closes the wrapped source exactly once, including when the worker task
/// is aborted mid-stream.
struct ScopedSource {
    inner: Box<dyn FrameSource>,
    closed: bool,
}

impl ScopedSource {
    fn new(inner: Box<dyn FrameSource>) -> Self {
        Self { inner, closed: false }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.close();
        }
    }
}

impl Drop for ScopedSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background task bound to one session: dequeues tracks, drives their frame
/// sources into the voice sink and services control messages between frames.
pub(crate) struct PlaybackWorker {
    session: Arc<Session>,
}

impl PlaybackWorker {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub(crate) async fn run(self) {
        let guild_id = self.session.guild_id();
        debug!("Worker for guild {} is idle", guild_id);

        while let Some(track) = self.next_track().await {
            let title = track.title.clone();
            match self.play(track).await {
                StreamEnd::Finished => info!("✅ Finished {} in guild {}", title, guild_id),
                StreamEnd::Skipped => info!("⏭️ Skipped {} in guild {}", title, guild_id),
                StreamEnd::Stopped => info!("⏹️ Stopped {} in guild {}", title, guild_id),
                StreamEnd::Failed(e) => error!("❌ Playback of {} failed in guild {}: {}", title, guild_id, e),
                StreamEnd::Shutdown => break,
            }
        }

        self.session.set_player_state(PlayerState::Draining);
        info!("🛑 Worker for guild {} exited", guild_id);
    }

    /// Waits in `Idle` until a track can be dequeued. `None` on shutdown.
    async fn next_track(&self) -> Option<Track> {
        let session = &self.session;
        let control = session.control_rx();
        let shutdown = session.shutdown_token();

        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(track) = session.begin_next() {
                return Some(track);
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                msg = control.recv_async() => match msg {
                    Ok(Control::Resume) => {
                        if session.release() {
                            info!("▶️ Guild {} resumed after stop", session.guild_id());
                        }
                    }
                    Ok(other) => debug!("Ignoring {:?} while idle in guild {}", other, session.guild_id()),
                    Err(_) => return None,
                },
                _ = session.wake().notified() => {}
            }
        }
    }

    /// Streams one track with the speaking flag and the frame source held as
    /// scoped resources.
    async fn play(&self, track: Track) -> StreamEnd {
        let session = &self.session;
        let shutdown = session.shutdown_token();

        let opened = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                session.finish_current();
                return StreamEnd::Shutdown;
            }
            opened = session.frames().open(&track) => opened,
        };
        let mut source = match opened {
            Ok(source) => ScopedSource::new(source),
            Err(e) => {
                session.finish_current();
                return StreamEnd::Failed(e);
            }
        };

        info!(
            "🎵 Now playing {} ({}) in guild {}",
            track.title,
            humantime::format_duration(track.duration),
            session.guild_id()
        );

        let end = match session.sink().set_speaking(true).await {
            Ok(()) => {
                session.set_player_state(PlayerState::Streaming);
                let end = self.stream(source.inner.as_mut()).await;
                if let Err(e) = session.sink().set_speaking(false).await {
                    warn!("Failed to clear speaking flag in guild {}: {}", session.guild_id(), e);
                }
                end
            }
            Err(e) => StreamEnd::Failed(e),
        };

        source.close();
        if matches!(end, StreamEnd::Stopped) {
            session.hold();
        }
        session.finish_current();
        end
    }

    /// The per-frame loop. Control messages are checked before every frame
    /// is requested.
    async fn stream(&self, source: &mut dyn FrameSource) -> StreamEnd {
        let session = &self.session;
        let control = session.control_rx();
        let shutdown = session.shutdown_token();
        let sink = session.sink();
        let mut started = Instant::now();

        loop {
            match control.try_recv() {
                Ok(Control::Skip) => return StreamEnd::Skipped,
                Ok(Control::Stop) => return StreamEnd::Stopped,
                Ok(Control::Pause) => {
                    let paused_at = Instant::now();
                    session.set_player_state(PlayerState::Paused);
                    info!("⏸️ Paused in guild {}", session.guild_id());

                    match self.wait_while_paused().await {
                        PauseEnd::Resumed => {
                            started += paused_at.elapsed();
                            session.set_player_state(PlayerState::Streaming);
                            info!("▶️ Resumed in guild {}", session.guild_id());
                        }
                        PauseEnd::Skipped => return StreamEnd::Skipped,
                        PauseEnd::Stopped => return StreamEnd::Stopped,
                        PauseEnd::Shutdown => return StreamEnd::Shutdown,
                    }
                }
                Ok(Control::Resume) => debug!("Already streaming in guild {}", session.guild_id()),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return StreamEnd::Shutdown,
            }

            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return StreamEnd::Shutdown,
                frame = source.next_frame() => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    let sent = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return StreamEnd::Shutdown,
                        sent = sink.send(frame) => sent,
                    };
                    if let Err(e) = sent {
                        return StreamEnd::Failed(e);
                    }
                    session.update_progress(started.elapsed());
                }
                Ok(None) => return StreamEnd::Finished,
                Err(e) => return StreamEnd::Failed(e),
            }
        }
    }

    /// Blocks on the control channel only; no frames are pulled meanwhile.
    async fn wait_while_paused(&self) -> PauseEnd {
        let control = self.session.control_rx();
        let shutdown = self.session.shutdown_token();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return PauseEnd::Shutdown,
                msg = control.recv_async() => match msg {
                    Ok(Control::Resume) => return PauseEnd::Resumed,
                    Ok(Control::Skip) => return PauseEnd::Skipped,
                    Ok(Control::Stop) => return PauseEnd::Stopped,
                    Ok(Control::Pause) => {}
                    Err(_) => return PauseEnd::Shutdown,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{eventually, track, RecordingSink, Script, ScriptedFrames};
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};
    use std::{sync::atomic::Ordering, time::Duration};

    const GRACE: Duration = Duration::from_secs(2);

    fn session(
        capacity: usize,
        sink: &Arc<RecordingSink>,
        frames: &Arc<ScriptedFrames>,
    ) -> Arc<Session> {
        Arc::new(Session::new(
            GuildId::new(1),
            ChannelId::new(2),
            capacity,
            sink.clone(),
            frames.clone(),
        ))
    }

    fn current_title(session: &Session) -> Option<String> {
        session.current().map(|t| t.title)
    }

    #[tokio::test]
    async fn test_plays_queue_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let frames = Arc::new(
            ScriptedFrames::default()
                .with("a", Script::Frames(3))
                .with("b", Script::Frames(2)),
        );
        let session = session(8, &sink, &frames);

        assert_eq!(session.enqueue(track("a", 60)), Ok(1));
        assert_eq!(session.enqueue(track("b", 60)), Ok(2));

        eventually("both tracks closed", || frames.count("close") == 2).await;
        eventually("worker idle", || session.player_state() == PlayerState::Idle).await;

        assert_eq!(
            sink.frames_as_strings(),
            vec!["a:0", "a:1", "a:2", "b:0", "b:1"]
        );
        assert_eq!(*sink.speaking.lock(), vec![true, false, true, false]);
        assert_eq!(frames.events(), vec!["open a", "close a", "open b", "close b"]);
        assert!(session.current().is_none());

        session.shutdown(GRACE).await;
    }

    #[tokio::test]
    async fn test_skip_advances_to_next_track() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(
            ScriptedFrames::default()
                .with("Song A", Script::Frames(100_000))
                .with("Song B", Script::Frames(100_000)),
        );
        let session = session(2, &sink, &frames);

        assert_eq!(session.enqueue(track("Song A", 180)), Ok(1));
        assert_eq!(session.enqueue(track("Song B", 200)), Ok(2));
        assert_eq!(
            session.enqueue(track("Song C", 10)),
            Err(MusicError::QueueFull { capacity: 2 })
        );

        eventually("A streaming", || {
            current_title(&session).as_deref() == Some("Song A") && sink.frame_count() > 0
        })
        .await;
        assert_eq!(session.snapshot().queued.len(), 1);

        session.control(Control::Skip).unwrap();
        eventually("B current", || current_title(&session).as_deref() == Some("Song B")).await;
        assert_eq!(session.snapshot().queued.len(), 0);
        assert_eq!(frames.events()[..3], ["open Song A", "close Song A", "open Song B"]);

        session.shutdown(GRACE).await;
        assert_eq!(frames.count("open"), frames.count("close"));
    }

    #[tokio::test]
    async fn test_pause_and_resume_keep_every_frame() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(ScriptedFrames::default().with("long", Script::Frames(60)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("long", 120)).unwrap();
        eventually("some frames", || sink.frame_count() >= 5).await;

        session.control(Control::Pause).unwrap();
        eventually("paused", || session.player_state() == PlayerState::Paused).await;
        let frozen = sink.frame_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.frame_count(), frozen);
        assert_eq!(current_title(&session).as_deref(), Some("long"));

        session.control(Control::Resume).unwrap();
        eventually("track done", || frames.count("close") == 1).await;

        let expected: Vec<String> = (0..60).map(|i| format!("long:{i}")).collect();
        assert_eq!(sink.frames_as_strings(), expected);
        assert_eq!(frames.count("open"), 1);

        session.shutdown(GRACE).await;
    }

    #[tokio::test]
    async fn test_skip_is_honoured_while_paused() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(ScriptedFrames::default().with("a", Script::Frames(100_000)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 120)).unwrap();
        session.enqueue(track("b", 120)).unwrap();
        eventually("a streaming", || sink.frame_count() > 0).await;

        session.control(Control::Pause).unwrap();
        eventually("paused", || session.player_state() == PlayerState::Paused).await;
        session.control(Control::Skip).unwrap();

        eventually("b played", || frames.count("close b") == 1).await;
        assert_eq!(frames.events(), vec!["open a", "close a", "open b", "close b"]);

        session.shutdown(GRACE).await;
    }

    #[tokio::test]
    async fn test_stop_holds_queue_until_resume() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(ScriptedFrames::default().with("a", Script::Frames(100_000)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 120)).unwrap();
        session.enqueue(track("b", 120)).unwrap();
        eventually("a streaming", || sink.frame_count() > 0).await;

        session.control(Control::Stop).unwrap();
        eventually("a closed", || frames.count("close a") == 1).await;
        eventually("idle", || session.player_state() == PlayerState::Idle).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.current().is_none());
        assert_eq!(session.snapshot().queued.len(), 1);
        assert_eq!(frames.count("open b"), 0);

        session.control(Control::Resume).unwrap();
        eventually("b played", || frames.count("close b") == 1).await;

        session.shutdown(GRACE).await;
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_restarts_playback() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(ScriptedFrames::default().with("a", Script::Frames(100_000)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 120)).unwrap();
        eventually("a streaming", || sink.frame_count() > 0).await;
        session.control(Control::Stop).unwrap();
        eventually("idle", || {
            frames.count("close a") == 1 && session.player_state() == PlayerState::Idle
        })
        .await;

        session.enqueue(track("c", 30)).unwrap();
        eventually("c played", || frames.count("close c") == 1).await;

        session.shutdown(GRACE).await;
    }

    #[tokio::test]
    async fn test_failures_do_not_stall_the_queue() {
        let sink = Arc::new(RecordingSink::default());
        let frames = Arc::new(
            ScriptedFrames::default()
                .with("bad-open", Script::FailOpen)
                .with("bad-stream", Script::FailAfter(2))
                .with("good", Script::Frames(1)),
        );
        let session = session(4, &sink, &frames);

        session.enqueue(track("bad-open", 10)).unwrap();
        session.enqueue(track("bad-stream", 10)).unwrap();
        session.enqueue(track("good", 10)).unwrap();

        eventually("good played", || frames.count("close good") == 1).await;
        assert_eq!(
            frames.events(),
            vec![
                "fail bad-open",
                "open bad-stream",
                "close bad-stream",
                "open good",
                "close good"
            ]
        );
        assert_eq!(
            sink.frames_as_strings(),
            vec!["bad-stream:0", "bad-stream:1", "good:0"]
        );
        eventually("idle", || session.player_state() == PlayerState::Idle).await;

        session.shutdown(GRACE).await;
    }

    #[tokio::test]
    async fn test_shutdown_while_streaming_releases_everything() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(ScriptedFrames::default().with("a", Script::Frames(100_000)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 120)).unwrap();
        eventually("a streaming", || sink.frame_count() > 0).await;

        session.shutdown(GRACE).await;

        assert_eq!(frames.events(), vec!["open a", "close a"]);
        assert_eq!(frames.open.load(Ordering::SeqCst), 0);
        assert!(sink.disconnected.load(Ordering::SeqCst));
        assert_eq!(*sink.speaking.lock(), vec![true, false]);
        assert_eq!(session.player_state(), PlayerState::Draining);
        assert!(session.current().is_none());

        assert_eq!(session.enqueue(track("late", 1)), Err(MusicError::NotActive));
        assert_eq!(session.control(Control::Skip), Err(MusicError::NotActive));
    }

    #[tokio::test]
    async fn test_shutdown_while_paused_releases_pipeline() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(ScriptedFrames::default().with("a", Script::Frames(100_000)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 120)).unwrap();
        eventually("a streaming", || sink.frame_count() > 0).await;
        session.control(Control::Pause).unwrap();
        eventually("paused", || session.player_state() == PlayerState::Paused).await;

        session.shutdown(GRACE).await;
        assert_eq!(frames.events(), vec!["open a", "close a"]);
    }

    #[tokio::test]
    async fn test_stop_while_paused_closes_source_and_holds_queue() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(1)));
        let frames = Arc::new(
            ScriptedFrames::default()
                .with("a", Script::Frames(100_000))
                .with("b", Script::Frames(100_000)),
        );
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 120)).unwrap();
        session.enqueue(track("b", 120)).unwrap();
        eventually("a streaming", || sink.frame_count() > 0).await;
        session.control(Control::Pause).unwrap();
        eventually("paused", || session.player_state() == PlayerState::Paused).await;

        session.control(Control::Stop).unwrap();
        eventually("a closed", || frames.count("close a") == 1).await;
        eventually("idle", || session.player_state() == PlayerState::Idle).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(frames.events(), vec!["open a", "close a"]);
        assert_eq!(frames.open.load(Ordering::SeqCst), 0);
        assert!(session.current().is_none());
        assert_eq!(session.snapshot().queued.len(), 1);
        assert_eq!(session.player_state(), PlayerState::Idle);

        session.shutdown(GRACE).await;
    }

    #[tokio::test]
    async fn test_stuck_worker_is_aborted_and_its_source_closed() {
        let sink = Arc::new(RecordingSink::stalling_on_release());
        let frames = Arc::new(ScriptedFrames::default().with("a", Script::Frames(3)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 10)).unwrap();
        eventually("worker stuck releasing", || {
            *sink.speaking.lock() == vec![true, false]
        })
        .await;
        assert_eq!(frames.open.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(1), session.shutdown(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(frames.open.load(Ordering::SeqCst), 0);
        assert_eq!(frames.count("open"), frames.count("close"));
        assert!(sink.disconnected.load(Ordering::SeqCst));
        assert_eq!(session.player_state(), PlayerState::Draining);
    }

    #[tokio::test]
    async fn test_progress_tracks_elapsed_time() {
        let sink = Arc::new(RecordingSink::paced(Duration::from_millis(5)));
        let frames = Arc::new(ScriptedFrames::default().with("a", Script::Frames(100_000)));
        let session = session(4, &sink, &frames);

        session.enqueue(track("a", 180)).unwrap();
        eventually("a streaming", || sink.frame_count() > 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let current = session.current().unwrap();
        assert!(current.remaining < current.duration);
        assert!(current.elapsed() < Duration::from_secs(5));

        session.shutdown(GRACE).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueues_share_one_worker() {
        let sink = Arc::new(RecordingSink::default());
        let frames = Arc::new(ScriptedFrames::default());
        let session = session(32, &sink, &frames);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                session.enqueue(track(&format!("t{i}"), 10)).unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        eventually("all played", || frames.count("close") == 16).await;
        assert_eq!(frames.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(sink.frame_count(), 16 * 3);
        assert_eq!(*sink.speaking.lock(), [true, false].repeat(16));

        session.shutdown(GRACE).await;
    }
}

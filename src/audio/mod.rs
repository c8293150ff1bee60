//! # Audio Module
//!
//! Per-guild playback for Mountain Music.
//!
//! ## Architecture
//!
//! ### [`registry`] - Session Registry
//! - One [`session::Session`] per guild, created on join and torn down on leave
//!
//! ### [`session`] - Session
//! - Bounded FIFO [`queue::TrackQueue`] plus the track currently playing
//! - Control channel (skip, pause, resume, stop) drained by the worker
//!
//! ### [`player`] - Playback Worker
//! - At most one per session, spawned on the first enqueue
//! - Moves frames from a [`frames::FrameSource`] to a [`sink::VoiceSink`]
//!
//! ### [`frames`] - Frame Source
//! - `yt-dlp | dca` process pipeline producing length-prefixed Opus frames
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz
//! - **Channels**: Stereo
//! - **Frame Size**: 960 samples (20ms)
//! - **Encoding**: Opus, bitrate from `OPUS_BITRATE`

pub mod frames;
pub mod manager;
pub mod player;
pub mod queue;
pub mod registry;
pub mod session;
pub mod sink;
pub mod track;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::MusicManager;
pub use session::{Control, PlayerState, SessionInfo};
pub use track::{Requester, Track};

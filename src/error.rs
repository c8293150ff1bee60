use thiserror::Error;

/// Failures reported by the playback engine.
///
/// None of these are fatal to the process: lifecycle misuse and capacity
/// errors go back to the caller, pipeline errors make the worker advance to
/// the next track.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MusicError {
    #[error("I'm already in a voice channel!")]
    AlreadyActive,

    #[error("I'm not in a voice channel")]
    NotActive,

    #[error("Can't queue any more tracks right now (max {capacity})")]
    QueueFull { capacity: usize },

    #[error("could not start playback: {0}")]
    ResolveFailed(String),

    #[error("audio pipeline failed: {0}")]
    DecodeFailed(String),

    #[error("You're not in a voice channel")]
    NotInVoice,

    #[error("no results for `{0}`")]
    NotFound(String),

    #[error("voice transport error: {0}")]
    Transport(String),
}

pub type MusicResult<T> = Result<T, MusicError>;
